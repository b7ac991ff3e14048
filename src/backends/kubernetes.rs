use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::{join_all, ready};
use futures::stream::{self, Stream, StreamExt};
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use kube::api::{Api, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Backend, BackendFactory};
use crate::discovery::{
    chunk_label, ContainerSpec, Descriptor, FleetBackend, Group, MemberChange, MemberEvent,
    MemberEventStream, MemberId,
};
use crate::error::DiscoveryError;
use crate::image::{CredentialRef, SecretStore};
use crate::settings::{default_describe_batch_size, BackendSettings, Settings};

const LIST_PAGE_SIZE: u32 = 500;

const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// Kubernetes fleet: namespaces are groups, pods are members.
pub struct KubernetesBackend {
    client: Client,
    namespaces: Vec<String>,
    batch_size: usize,
}

impl KubernetesBackend {
    /// `namespaces` restricts discovery and watching; empty means the whole
    /// cluster.
    pub fn new(client: Client, namespaces: Vec<String>, batch_size: usize) -> Self {
        Self {
            client,
            namespaces,
            batch_size: batch_size.max(1),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Follow `continue` tokens until every name has been listed
async fn list_names<K>(api: &Api<K>) -> kube::Result<Vec<String>>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let mut names = Vec::new();
    let mut continue_token: Option<String> = None;
    loop {
        let mut params = ListParams::default().limit(LIST_PAGE_SIZE);
        if let Some(token) = &continue_token {
            params = params.continue_token(token);
        }
        let page = api.list_metadata(&params).await?;
        names.extend(page.items.into_iter().filter_map(|item| item.metadata.name));

        continue_token = page.metadata.continue_.filter(|token| !token.is_empty());
        if continue_token.is_none() {
            return Ok(names);
        }
    }
}

/// Build the descriptor of a pod.
///
/// Containers are listed init containers first, then regular containers,
/// then ephemeral containers. Every container shares the pod's pull secrets.
pub fn pod_descriptor(namespace: &str, pod: &Pod) -> Descriptor {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let namespace = pod.metadata.namespace.as_deref().unwrap_or(namespace);

    let Some(spec) = &pod.spec else {
        return Descriptor {
            group: Group(namespace.to_string()),
            member: MemberId(name),
            containers: Vec::new(),
        };
    };

    let pull_secrets: Vec<String> = spec
        .image_pull_secrets
        .iter()
        .flatten()
        .map(|secret| secret.name.clone())
        .filter(|name| !name.is_empty())
        .collect();
    let credential_ref =
        (!pull_secrets.is_empty()).then(|| CredentialRef::scoped(namespace, pull_secrets));

    let spec_for = |name: &str, image: Option<&String>| ContainerSpec {
        name: name.to_string(),
        image: image.cloned().unwrap_or_default(),
        credential_ref: credential_ref.clone(),
    };

    let init = spec
        .init_containers
        .iter()
        .flatten()
        .map(|c| spec_for(&c.name, c.image.as_ref()));
    let regular = spec
        .containers
        .iter()
        .map(|c| spec_for(&c.name, c.image.as_ref()));
    let ephemeral = spec
        .ephemeral_containers
        .iter()
        .flatten()
        .map(|c| spec_for(&c.name, c.image.as_ref()));

    Descriptor {
        group: Group(namespace.to_string()),
        member: MemberId(name),
        containers: init.chain(regular).chain(ephemeral).collect(),
    }
}

/// Pods known to one watcher stream.
///
/// A re-list (`Init` .. `InitDone`) replaces the known set, so pods deleted
/// while the watch was desynced are forgotten.
#[derive(Default)]
struct PodTracker {
    seen: HashSet<String>,
    relisted: Option<HashSet<String>>,
}

impl PodTracker {
    /// Record `key`, returning whether it was new
    fn observe(&mut self, key: String) -> bool {
        if let Some(relisted) = &mut self.relisted {
            relisted.insert(key.clone());
        }
        self.seen.insert(key)
    }
}

fn pod_key(descriptor: &Descriptor) -> String {
    format!("{}/{}", descriptor.group, descriptor.member)
}

/// Translate one watcher event. Pods seen for the first time are `Added`,
/// re-applied pods are `Updated`.
fn member_event(
    tracker: &mut PodTracker,
    event: Result<watcher::Event<Pod>, watcher::Error>,
) -> Option<Result<MemberEvent, DiscoveryError>> {
    let pod = match event {
        Ok(watcher::Event::Apply(pod)) | Ok(watcher::Event::InitApply(pod)) => pod,
        Ok(watcher::Event::Delete(pod)) => {
            tracker.seen.remove(&pod_key(&pod_descriptor("", &pod)));
            return None;
        }
        Ok(watcher::Event::Init) => {
            tracker.relisted = Some(HashSet::new());
            return None;
        }
        Ok(watcher::Event::InitDone) => {
            if let Some(relisted) = tracker.relisted.take() {
                tracker.seen = relisted;
            }
            return None;
        }
        Err(e) => return Some(Err(DiscoveryError::backend("watch pods", "kubernetes", e))),
    };

    let descriptor = pod_descriptor("", &pod);
    let is_new = tracker.observe(pod_key(&descriptor));
    let change = MemberChange {
        group: descriptor.group.clone(),
        member: descriptor.member.clone(),
        descriptor: Some(descriptor),
    };
    Some(Ok(if is_new {
        MemberEvent::Added(change)
    } else {
        MemberEvent::Updated(change)
    }))
}

/// Back off between reconnects and translate pod events into member events
fn member_events<S>(events: S) -> MemberEventStream
where
    S: Stream<Item = Result<watcher::Event<Pod>, watcher::Error>> + Send + 'static,
{
    events
        .default_backoff()
        .scan(PodTracker::default(), |tracker, event| {
            ready(Some(member_event(tracker, event)))
        })
        .filter_map(ready)
        .boxed()
}

#[async_trait]
impl FleetBackend for KubernetesBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn batch_limit(&self) -> usize {
        self.batch_size
    }

    async fn list_groups(&self) -> Result<Vec<Group>, DiscoveryError> {
        if !self.namespaces.is_empty() {
            return Ok(self.namespaces.iter().cloned().map(Group).collect());
        }

        let api: Api<Namespace> = Api::all(self.client.clone());
        let names = list_names(&api)
            .await
            .map_err(|e| DiscoveryError::backend("list namespaces", "kubernetes", e))?;
        debug!("Found {} namespaces", names.len());
        Ok(names.into_iter().map(Group).collect())
    }

    async fn list_members(&self, group: &Group) -> Result<Vec<MemberId>, DiscoveryError> {
        let names = list_names(&self.pods(group.as_str()))
            .await
            .map_err(|e| DiscoveryError::backend("list pods", group.as_str(), e))?;
        Ok(names.into_iter().map(MemberId).collect())
    }

    async fn describe(
        &self,
        group: &Group,
        members: &[MemberId],
    ) -> Result<Vec<Descriptor>, DiscoveryError> {
        let api = self.pods(group.as_str());
        let pods = join_all(members.iter().map(|member| api.get_opt(member.as_str()))).await;

        let mut descriptors = Vec::with_capacity(members.len());
        for (member, pod) in members.iter().zip(pods) {
            match pod {
                Ok(Some(pod)) => descriptors.push(pod_descriptor(group.as_str(), &pod)),
                Ok(None) => debug!(namespace = %group, pod = %member, "Pod vanished before describe"),
                Err(e) => {
                    return Err(DiscoveryError::backend(
                        "get pods",
                        chunk_label(group, members),
                        e,
                    ))
                }
            }
        }
        Ok(descriptors)
    }

    async fn subscribe(&self) -> Result<MemberEventStream, DiscoveryError> {
        let config = watcher::Config::default();
        if self.namespaces.is_empty() {
            info!("Watching pods in all namespaces");
            return Ok(member_events(watcher(
                Api::<Pod>::all(self.client.clone()),
                config,
            )));
        }

        info!("Watching pods in namespaces: {}", self.namespaces.join(", "));
        Ok(stream::select_all(
            self.namespaces
                .iter()
                .map(|ns| member_events(watcher(self.pods(ns), config.clone()))),
        )
        .boxed())
    }
}

/// Reads `kubernetes.io/dockerconfigjson` secrets from the pod's namespace
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Extract the docker config payload from a pull secret
fn docker_config_json(label: &str, secret: &Secret) -> Result<Vec<u8>> {
    let secret_type = secret.type_.as_deref().unwrap_or_default();
    if secret_type != DOCKER_CONFIG_JSON_TYPE {
        return Err(DiscoveryError::decode(
            label,
            format!(
                "secret type is {:?}, expected {}",
                secret_type, DOCKER_CONFIG_JSON_TYPE
            ),
        )
        .into());
    }

    match secret
        .data
        .as_ref()
        .and_then(|data| data.get(DOCKER_CONFIG_JSON_KEY))
    {
        Some(value) => Ok(value.0.clone()),
        None => Err(DiscoveryError::decode(
            label,
            format!("secret has no {} key", DOCKER_CONFIG_JSON_KEY),
        )
        .into()),
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get_secret(&self, scope: Option<&str>, name: &str) -> Result<Vec<u8>> {
        let Some(namespace) = scope else {
            bail!("pull secret {} has no namespace", name);
        };
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await?;
        docker_config_json(&format!("{}/{}", namespace, name), &secret)
    }
}

/// Connects to the cluster using the `kubernetes` backend settings
pub struct KubernetesFactory;

#[async_trait]
impl BackendFactory for KubernetesFactory {
    async fn build(&self, settings: &Settings) -> Result<Backend> {
        let (kubeconfig, context, namespaces, batch_size) = match settings.backend.clone() {
            BackendSettings::Kubernetes {
                kubeconfig,
                context,
                namespaces,
                describe_batch_size,
            } => (kubeconfig, context, namespaces, describe_batch_size),
            other => {
                warn!(
                    "Backend settings are for '{}', connecting to Kubernetes with defaults",
                    other.name()
                );
                (None, None, Vec::new(), default_describe_batch_size())
            }
        };

        // Install default CryptoProvider for rustls (required for kube-rs HTTPS connections)
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();

        let options = kube::config::KubeConfigOptions {
            context,
            cluster: None,
            user: None,
        };
        let kube_config = if let Some(path) = kubeconfig {
            info!("Loading kubeconfig from {}", path);
            let kubeconfig = kube::config::Kubeconfig::read_from(&path)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?
        } else if options.context.is_some() {
            kube::Config::from_kubeconfig(&options).await?
        } else {
            kube::Config::infer().await? // In-cluster or ~/.kube/config
        };
        let client = Client::try_from(kube_config)?;

        Ok(Backend {
            fleet: Arc::new(KubernetesBackend::new(client.clone(), namespaces, batch_size)),
            secrets: Arc::new(KubeSecretStore::new(client)),
        })
    }
}

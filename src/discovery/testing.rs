//! In-memory backend and secret store used by unit tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    chunk_label, ContainerSpec, Descriptor, FleetBackend, Group, MemberEvent, MemberEventStream,
    MemberId,
};
use crate::error::DiscoveryError;
use crate::image::{CredentialRef, SecretStore};

pub(crate) fn container(name: &str, image: &str, credential_ref: Option<CredentialRef>) -> ContainerSpec {
    ContainerSpec {
        name: name.to_string(),
        image: image.to_string(),
        credential_ref,
    }
}

pub(crate) fn descriptor(group: &str, member: &str, containers: Vec<ContainerSpec>) -> Descriptor {
    Descriptor {
        group: group.into(),
        member: member.into(),
        containers,
    }
}

type EventSender = mpsc::UnboundedSender<Result<MemberEvent, DiscoveryError>>;
type EventReceiver = mpsc::UnboundedReceiver<Result<MemberEvent, DiscoveryError>>;

/// Fleet whose members are named `{group}-m-{i}` and each run a single
/// container `registry.example.com/{member}:1.0`, unless overridden.
pub(crate) struct FakeBackend {
    limit: usize,
    groups: Vec<String>,
    members: HashMap<String, Vec<String>>,
    overrides: HashMap<String, Vec<ContainerSpec>>,
    fail_groups: bool,
    fail_members: Vec<String>,
    fail_describe: Vec<String>,
    latency: Option<Duration>,
    describe_calls: Arc<Mutex<Vec<(String, usize)>>>,
    in_flight: AtomicUsize,
    peak: Arc<AtomicUsize>,
    watch: bool,
    feed_tx: EventSender,
    feed_rx: Mutex<Option<EventReceiver>>,
}

impl FakeBackend {
    pub(crate) fn new(limit: usize) -> Self {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        Self {
            limit,
            groups: Vec::new(),
            members: HashMap::new(),
            overrides: HashMap::new(),
            fail_groups: false,
            fail_members: Vec::new(),
            fail_describe: Vec::new(),
            latency: None,
            describe_calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: AtomicUsize::new(0),
            peak: Arc::new(AtomicUsize::new(0)),
            watch: true,
            feed_tx,
            feed_rx: Mutex::new(Some(feed_rx)),
        }
    }

    pub(crate) fn with_group(mut self, group: &str, members: usize) -> Self {
        self.groups.push(group.to_string());
        self.members.insert(
            group.to_string(),
            (0..members).map(|i| format!("{}-m-{}", group, i)).collect(),
        );
        self
    }

    pub(crate) fn with_descriptor(
        mut self,
        group: &str,
        member: &str,
        containers: Vec<ContainerSpec>,
    ) -> Self {
        if !self.groups.iter().any(|g| g == group) {
            self.groups.push(group.to_string());
        }
        self.members
            .entry(group.to_string())
            .or_default()
            .push(member.to_string());
        self.overrides.insert(member.to_string(), containers);
        self
    }

    pub(crate) fn fail_list_groups(mut self) -> Self {
        self.fail_groups = true;
        self
    }

    pub(crate) fn fail_list_members(mut self, group: &str) -> Self {
        self.fail_members.push(group.to_string());
        self
    }

    /// Fail any describe call whose chunk contains `member`.
    pub(crate) fn fail_describe_containing(mut self, member: &str) -> Self {
        self.fail_describe.push(member.to_string());
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub(crate) fn without_watch(mut self) -> Self {
        self.watch = false;
        self
    }

    pub(crate) fn describe_calls(&self) -> Arc<Mutex<Vec<(String, usize)>>> {
        self.describe_calls.clone()
    }

    pub(crate) fn peak_in_flight(&self) -> Arc<AtomicUsize> {
        self.peak.clone()
    }

    pub(crate) fn event_feed(&self) -> EventSender {
        self.feed_tx.clone()
    }

    async fn call(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl FleetBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn batch_limit(&self) -> usize {
        self.limit
    }

    async fn list_groups(&self) -> Result<Vec<Group>, DiscoveryError> {
        self.call().await;
        if self.fail_groups {
            return Err(DiscoveryError::backend(
                "list groups",
                "fake",
                anyhow::anyhow!("access denied"),
            ));
        }
        Ok(self.groups.iter().map(|g| Group(g.clone())).collect())
    }

    async fn list_members(&self, group: &Group) -> Result<Vec<MemberId>, DiscoveryError> {
        self.call().await;
        if self.fail_members.iter().any(|g| g == group.as_str()) {
            return Err(DiscoveryError::backend(
                "list members",
                group.to_string(),
                anyhow::anyhow!("connection reset"),
            ));
        }
        Ok(self
            .members
            .get(group.as_str())
            .map(|members| members.iter().map(|m| MemberId(m.clone())).collect())
            .unwrap_or_default())
    }

    async fn describe(
        &self,
        group: &Group,
        members: &[MemberId],
    ) -> Result<Vec<Descriptor>, DiscoveryError> {
        assert!(
            members.len() <= self.limit,
            "describe called with {} members, limit is {}",
            members.len(),
            self.limit
        );
        self.describe_calls
            .lock()
            .unwrap()
            .push((group.to_string(), members.len()));
        self.call().await;

        if members
            .iter()
            .any(|m| self.fail_describe.iter().any(|f| f == m.as_str()))
        {
            return Err(DiscoveryError::backend(
                "describe",
                chunk_label(group, members),
                anyhow::anyhow!("throttled"),
            ));
        }

        Ok(members
            .iter()
            .map(|member| Descriptor {
                group: group.clone(),
                member: member.clone(),
                containers: self.overrides.get(member.as_str()).cloned().unwrap_or_else(|| {
                    vec![container(
                        "main",
                        &format!("registry.example.com/{}:1.0", member),
                        None,
                    )]
                }),
            })
            .collect())
    }

    async fn subscribe(&self) -> Result<MemberEventStream, DiscoveryError> {
        if !self.watch {
            return Err(DiscoveryError::Unsupported("fake backend cannot watch".into()));
        }
        let rx = self
            .feed_rx
            .lock()
            .unwrap()
            .take()
            .expect("fake feed can only be subscribed once");
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }
}

/// Secret store backed by a map, counting lookups.
#[derive(Default)]
pub(crate) struct FakeSecretStore {
    secrets: HashMap<String, Vec<u8>>,
    calls: AtomicUsize,
}

impl FakeSecretStore {
    pub(crate) fn with_secret(mut self, name: &str, value: &str) -> Self {
        self.secrets.insert(name.to_string(), value.as_bytes().to_vec());
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for FakeSecretStore {
    async fn get_secret(&self, _scope: Option<&str>, name: &str) -> anyhow::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("secret {} not found", name))
    }
}

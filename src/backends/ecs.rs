use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ecs::types::ContainerDefinition;
use aws_sdk_ecs::Client as EcsClient;
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use futures::future::try_join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Backend, BackendFactory};
use crate::discovery::{
    chunk_label, ContainerSpec, Descriptor, Extraction, FleetBackend, Group, ImageExtractor,
    MemberId,
};
use crate::error::DiscoveryError;
use crate::image::{CredentialRef, SecretStore};
use crate::settings::{default_region, BackendSettings, Settings};

/// `DescribeServices` accepts at most this many services per call.
const DESCRIBE_SERVICES_LIMIT: usize = 10;

const RUNNING: &str = "RUNNING";

/// Pull the human-readable message out of an AWS SDK error
fn format_sdk_error<E: std::fmt::Debug>(err: &E) -> String {
    let debug_str = format!("{:?}", err);

    // Pattern: message: Some("actual error message")
    if let Some(start) = debug_str.find("message: Some(\"") {
        let start = start + "message: Some(\"".len();
        if let Some(end) = debug_str[start..].find("\")") {
            return debug_str[start..start + end].to_string();
        }
    }

    if debug_str.len() > 200 {
        let cut = (0..=200)
            .rev()
            .find(|i| debug_str.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}...", &debug_str[..cut])
    } else {
        debug_str
    }
}

fn sdk_error<E: std::fmt::Debug>(err: E) -> anyhow::Error {
    anyhow!(format_sdk_error(&err))
}

/// Amazon ECS fleet: clusters are groups, services are members.
pub struct EcsBackend {
    client: EcsClient,
}

impl EcsBackend {
    pub fn new(client: EcsClient) -> Self {
        Self { client }
    }

    async fn container_specs(&self, task_definition: &str) -> Result<Vec<ContainerSpec>> {
        let output = self
            .client
            .describe_task_definition()
            .task_definition(task_definition)
            .send()
            .await
            .map_err(sdk_error)?;

        Ok(output
            .task_definition()
            .map(|definition| {
                definition
                    .container_definitions()
                    .iter()
                    .map(container_spec)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Extract images for an EventBridge "ECS Task State Change" event.
    ///
    /// Accepts the full event envelope or only its `detail` object. Tasks
    /// that are not meant to be running yield no images.
    pub async fn images_for_task_event(
        &self,
        event: &Value,
        extractor: &ImageExtractor,
    ) -> Result<Extraction> {
        let Some(task) = TaskEvent::parse(event)? else {
            debug!("Ignoring task event whose desired status is not RUNNING");
            return Ok(Extraction::default());
        };

        info!(
            task = %task.task_arn,
            task_definition = %task.task_definition_arn,
            "Extracting images for task"
        );

        let containers = self
            .container_specs(&task.task_definition_arn)
            .await
            .map_err(|e| {
                DiscoveryError::backend("describe task definition", &task.task_definition_arn, e)
            })?;

        let descriptor = Descriptor {
            group: Group(task.cluster_arn),
            member: MemberId(task.task_arn),
            containers,
        };
        Ok(extractor.extract(&descriptor).await)
    }
}

fn container_spec(definition: &ContainerDefinition) -> ContainerSpec {
    to_container_spec(
        definition.name(),
        definition.image(),
        definition
            .repository_credentials()
            .map(|credentials| credentials.credentials_parameter()),
    )
}

fn to_container_spec(
    name: Option<&str>,
    image: Option<&str>,
    credentials_parameter: Option<&str>,
) -> ContainerSpec {
    ContainerSpec {
        name: name.unwrap_or_default().to_string(),
        image: image.unwrap_or_default().to_string(),
        credential_ref: credentials_parameter
            .filter(|arn| !arn.is_empty())
            .map(CredentialRef::new),
    }
}

#[async_trait]
impl FleetBackend for EcsBackend {
    fn name(&self) -> &'static str {
        "ecs"
    }

    fn batch_limit(&self) -> usize {
        DESCRIBE_SERVICES_LIMIT
    }

    async fn list_groups(&self) -> Result<Vec<Group>, DiscoveryError> {
        let mut clusters = Vec::new();
        let mut next_token = None;
        loop {
            let output = self
                .client
                .list_clusters()
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| DiscoveryError::backend("list clusters", "ecs", sdk_error(e)))?;

            clusters.extend(output.cluster_arns().iter().cloned().map(Group));
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        debug!("Found {} ECS clusters", clusters.len());
        Ok(clusters)
    }

    async fn list_members(&self, group: &Group) -> Result<Vec<MemberId>, DiscoveryError> {
        let mut services = Vec::new();
        let mut next_token = None;
        loop {
            let output = self
                .client
                .list_services()
                .cluster(group.as_str())
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| DiscoveryError::backend("list services", group.as_str(), sdk_error(e)))?;

            services.extend(output.service_arns().iter().cloned().map(MemberId));
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(services)
    }

    async fn describe(
        &self,
        group: &Group,
        members: &[MemberId],
    ) -> Result<Vec<Descriptor>, DiscoveryError> {
        let target = || chunk_label(group, members);

        let output = self
            .client
            .describe_services()
            .cluster(group.as_str())
            .set_services(Some(members.iter().map(|m| m.0.clone()).collect()))
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("describe services", target(), sdk_error(e)))?;

        for failure in output.failures() {
            warn!(
                cluster = %group,
                service = failure.arn().unwrap_or_default(),
                reason = failure.reason().unwrap_or_default(),
                "ECS could not describe service"
            );
        }

        let lookups = output.services().iter().filter_map(|service| {
            let task_definition = service.task_definition()?;
            let member = service
                .service_arn()
                .or(service.service_name())
                .unwrap_or(task_definition)
                .to_string();
            Some(async move {
                let containers = self.container_specs(task_definition).await?;
                Ok::<_, anyhow::Error>(Descriptor {
                    group: group.clone(),
                    member: MemberId(member),
                    containers,
                })
            })
        });

        try_join_all(lookups)
            .await
            .map_err(|e| DiscoveryError::backend("describe task definitions", target(), e))
    }
}

/// The fields of an ECS task state change needed to find its images
#[derive(Debug, PartialEq, Eq)]
struct TaskEvent {
    cluster_arn: String,
    task_arn: String,
    task_definition_arn: String,
}

impl TaskEvent {
    /// `Ok(None)` when the task is not meant to be running.
    fn parse(event: &Value) -> Result<Option<Self>> {
        let detail = event.get("detail").unwrap_or(event);
        if !detail.is_object() {
            bail!("ECS task event has no detail object");
        }

        let field = |key: &str| detail.get(key).and_then(Value::as_str);

        let desired_status = field("desiredStatus").context("ECS task event has no desiredStatus")?;
        if desired_status != RUNNING {
            return Ok(None);
        }

        let task_definition_arn = field("taskDefinitionArn")
            .context("ECS task event has no taskDefinitionArn")?
            .to_string();

        Ok(Some(Self {
            cluster_arn: field("clusterArn").unwrap_or_default().to_string(),
            task_arn: field("taskArn").unwrap_or_default().to_string(),
            task_definition_arn,
        }))
    }
}

/// AWS Secrets Manager holding registry credentials referenced by task
/// definitions. The scope is ignored.
pub struct EcsSecretStore {
    client: SecretsManagerClient,
}

impl EcsSecretStore {
    pub fn new(client: SecretsManagerClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for EcsSecretStore {
    async fn get_secret(&self, _scope: Option<&str>, name: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_secret_value()
            .secret_id(name)
            .send()
            .await
            .map_err(sdk_error)?;

        if let Some(value) = output.secret_string() {
            return Ok(value.as_bytes().to_vec());
        }
        if let Some(blob) = output.secret_binary() {
            return Ok(blob.as_ref().to_vec());
        }
        bail!("secret {} has no value", name)
    }
}

/// Connects to ECS and Secrets Manager using the `ecs` backend settings
pub struct EcsFactory;

impl EcsFactory {
    /// Connect the concrete ECS clients. Used directly by callers that need
    /// ECS-only operations such as task events.
    pub async fn connect(settings: &Settings) -> Result<(EcsBackend, EcsSecretStore)> {
        let (region, access_key_id, secret_access_key) = match &settings.backend {
            BackendSettings::Ecs {
                region,
                access_key_id,
                secret_access_key,
            } => (
                region.clone(),
                access_key_id.clone().filter(|v| !v.is_empty()),
                secret_access_key.clone().filter(|v| !v.is_empty()),
            ),
            other => {
                warn!(
                    "Backend settings are for '{}', connecting to ECS with the default credential chain",
                    other.name()
                );
                (default_region(), None, None)
            }
        };

        let aws_config = if let (Some(access_key), Some(secret_key)) =
            (access_key_id, secret_access_key)
        {
            info!("Using static AWS credentials for ECS");
            let creds =
                aws_sdk_ecs::config::Credentials::new(access_key, secret_key, None, None, "static");
            aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(region.clone()))
                .credentials_provider(creds)
                .load()
                .await
        } else {
            info!("Using default AWS credential chain for ECS");
            aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(region.clone()))
                .load()
                .await
        };

        info!("ECS backend ready in region {}", region);
        Ok((
            EcsBackend::new(EcsClient::new(&aws_config)),
            EcsSecretStore::new(SecretsManagerClient::new(&aws_config)),
        ))
    }
}

#[async_trait]
impl BackendFactory for EcsFactory {
    async fn build(&self, settings: &Settings) -> Result<Backend> {
        let (fleet, secrets) = Self::connect(settings).await?;
        Ok(Backend {
            fleet: Arc::new(fleet),
            secrets: Arc::new(secrets),
        })
    }
}

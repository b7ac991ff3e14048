pub mod chunk;
pub mod extract;
pub mod pipeline;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk::split_into_chunks;
pub use extract::{Extraction, ImageExtractor};
pub use pipeline::{DiscoveryPipeline, DiscoveryReport};
pub use watch::{MemberChange, MemberEvent, MemberEventStream};

use async_trait::async_trait;
use std::fmt;

use crate::error::DiscoveryError;
use crate::image::CredentialRef;

/// A workload grouping in the backend platform (ECS cluster, Kubernetes
/// namespace). Only used as a traversal key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Group(pub String);

/// Identity of one deployable unit within a group (ECS service, pod).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberId(pub String);

impl Group {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl MemberId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Group {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for MemberId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Declaration of one container's image and the secret that may hold its
/// pull credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub credential_ref: Option<CredentialRef>,
}

/// Resolved detail record of a member. Zero containers is valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub group: Group,
    pub member: MemberId,
    pub containers: Vec<ContainerSpec>,
}

/// A platform hosting the fleet (ECS, Kubernetes, ...)
///
/// Implementations perform a single network round-trip (or paginated
/// sequence) per call and never retry; the pipeline decides how far a
/// failure reaches.
#[async_trait]
pub trait FleetBackend: Send + Sync {
    /// Short backend name used in logs and as the delivery origin
    fn name(&self) -> &'static str;

    /// Maximum number of members accepted by one `describe` call
    fn batch_limit(&self) -> usize;

    async fn list_groups(&self) -> Result<Vec<Group>, DiscoveryError>;

    async fn list_members(&self, group: &Group) -> Result<Vec<MemberId>, DiscoveryError>;

    /// Fetch descriptors for at most `batch_limit()` members of `group`.
    async fn describe(
        &self,
        group: &Group,
        members: &[MemberId],
    ) -> Result<Vec<Descriptor>, DiscoveryError>;

    /// Subscribe to member add/update events. Dropping the stream ends the
    /// subscription.
    async fn subscribe(&self) -> Result<MemberEventStream, DiscoveryError> {
        Err(DiscoveryError::Unsupported(format!(
            "backend {} does not provide a change feed",
            self.name()
        )))
    }
}

/// Human-readable label for a chunk of members, used in error targets.
pub(crate) fn chunk_label(group: &Group, members: &[MemberId]) -> String {
    let names: Vec<&str> = members.iter().map(MemberId::as_str).collect();
    format!("{} [{}]", group, names.join(", "))
}

use std::fmt;

/// Errors raised while walking a fleet inventory.
///
/// Every variant describes a failure isolated to one branch of a discovery
/// run (a group, a chunk of members, or a single container spec). Batch runs
/// collect them into an [`AggregatedError`]; stream runs hand them to the
/// caller one at a time.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Enumeration or description call against the backend platform failed
    /// (network, auth, throttling).
    #[error("{operation} failed for {target}: {source}")]
    BackendUnavailable {
        operation: &'static str,
        target: String,
        #[source]
        source: anyhow::Error,
    },

    /// The secret store could not produce the referenced secret.
    #[error("secret {secret} unavailable: {source}")]
    SecretUnavailable {
        secret: String,
        #[source]
        source: anyhow::Error,
    },

    /// The secret exists but is not a registry credential document.
    #[error("failed to decode registry credentials from {secret}: {reason}")]
    Decode { secret: String, reason: String },

    /// The image locator did not yield an image name.
    #[error("invalid image reference {locator:?}")]
    InvalidReference { locator: String },

    /// The selected backend cannot serve the requested operation.
    #[error("{0}")]
    Unsupported(String),

    /// The run was cancelled before every branch completed.
    #[error("discovery cancelled before completion")]
    Cancelled,
}

impl DiscoveryError {
    pub fn backend(
        operation: &'static str,
        target: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::BackendUnavailable {
            operation,
            target: target.into(),
            source: source.into(),
        }
    }

    pub fn secret(secret: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::SecretUnavailable {
            secret: secret.into(),
            source: source.into(),
        }
    }

    pub fn decode(secret: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Decode {
            secret: secret.into(),
            reason: reason.to_string(),
        }
    }
}

/// Every error observed during one batch discovery run.
#[derive(Debug, Default)]
pub struct AggregatedError(Vec<DiscoveryError>);

impl AggregatedError {
    pub fn new(errors: Vec<DiscoveryError>) -> Self {
        Self(errors)
    }

    pub fn errors(&self) -> &[DiscoveryError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AggregatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.0.len() == 1 { "error" } else { "errors" };
        write!(f, "discovery finished with {} {}", self.0.len(), noun)?;
        for err in &self.0 {
            write!(f, "\n  - {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregatedError {}

#[cfg(feature = "ecs")]
pub mod ecs;
#[cfg(feature = "kubernetes")]
pub mod kubernetes;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::discovery::FleetBackend;
use crate::image::SecretStore;
use crate::settings::Settings;

/// A connected backend: the fleet inventory plus the store holding its pull
/// secrets.
#[derive(Clone)]
pub struct Backend {
    pub fleet: Arc<dyn FleetBackend>,
    pub secrets: Arc<dyn SecretStore>,
}

/// Builds a [`Backend`] from settings
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn build(&self, settings: &Settings) -> Result<Backend>;
}

/// Explicit map of the backends this binary can talk to.
///
/// Built once at startup and passed by reference to whoever needs to pick a
/// backend by name.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    factories: BTreeMap<&'static str, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend compiled into this build
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "ecs")]
        registry.register("ecs", Arc::new(ecs::EcsFactory));
        #[cfg(feature = "kubernetes")]
        registry.register("kubernetes", Arc::new(kubernetes::KubernetesFactory));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: Arc<dyn BackendFactory>) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub async fn build(&self, name: &str, settings: &Settings) -> Result<Backend> {
        let Some(factory) = self.factories.get(name) else {
            bail!(
                "Backend '{}' is not supported (available: {})",
                name,
                self.names().join(", ")
            );
        };
        tracing::info!("Connecting to {} backend", name);
        factory.build(settings).await
    }
}

use config::{Config, ConfigError};
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::sync::LazyLock;

use crate::image::ReferenceMode;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is valid")
});

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub delivery: DeliverySettings,
}

fn default_concurrency() -> usize {
    16
}

pub(crate) fn default_describe_batch_size() -> usize {
    20
}

pub(crate) fn default_region() -> String {
    "eu-central-1".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoverySettings {
    /// Maximum number of backend calls in flight during a batch run (default: 16)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How image locators are split into name/tag/digest (default: registry-aware)
    /// "legacy" treats the port of a `host:port/name` locator as a tag.
    #[serde(default)]
    pub reference_mode: ReferenceMode,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            reference_mode: ReferenceMode::default(),
        }
    }
}

/// Fleet backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackendSettings {
    /// Amazon ECS clusters, with pull secrets in AWS Secrets Manager
    Ecs {
        /// AWS region (default: eu-central-1)
        #[serde(default = "default_region")]
        region: String,
        /// Optional: AWS access key ID (if not using the default credential chain)
        #[serde(default)]
        access_key_id: Option<String>,
        /// Optional: AWS secret access key (if not using the default credential chain)
        #[serde(default)]
        secret_access_key: Option<String>,
    },
    /// Kubernetes pods, with pull secrets in dockerconfigjson Secrets
    Kubernetes {
        /// Optional kubeconfig path (defaults to in-cluster or ~/.kube/config)
        #[serde(default)]
        kubeconfig: Option<String>,
        /// Optional kubeconfig context
        #[serde(default)]
        context: Option<String>,
        /// Namespaces to scan; empty scans every namespace
        #[serde(default)]
        namespaces: Vec<String>,
        /// Pods fetched per describe batch (default: 20)
        #[serde(default = "default_describe_batch_size")]
        describe_batch_size: usize,
    },
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings::Kubernetes {
            kubeconfig: None,
            context: None,
            namespaces: Vec::new(),
            describe_batch_size: default_describe_batch_size(),
        }
    }
}

impl BackendSettings {
    /// Name under which the backend is registered
    pub fn name(&self) -> &'static str {
        match self {
            BackendSettings::Ecs { .. } => "ecs",
            BackendSettings::Kubernetes { .. } => "kubernetes",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliverySettings {
    /// Origin tag attached to every delivered image (defaults to the backend name)
    #[serde(default)]
    pub origin: Option<String>,

    /// Attempts per image when the consumer is unavailable (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Linear backoff step between attempts in milliseconds (default: 100)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            origin: None,
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Unset and empty (e.g. `"${AWS_ACCESS_KEY_ID}"` with the variable unset)
/// are treated alike
fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

impl Settings {
    /// Expand `${VAR}` and `${VAR:-fallback}`. Unset variables without a
    /// fallback expand to the empty string.
    fn substitute_env_vars_in_string(s: &str) -> String {
        ENV_VAR_PATTERN
            .replace_all(s, |caps: &regex::Captures| {
                env::var(&caps[1]).unwrap_or_else(|_| {
                    caps.get(2).map_or_else(String::new, |m| m.as_str().to_string())
                })
            })
            .into_owned()
    }

    /// Config tree as JSON, with env vars expanded in every string leaf
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;
        use serde_json::Value as Json;

        match &value.kind {
            ValueKind::Nil => Json::Null,
            ValueKind::Boolean(b) => Json::Bool(*b),
            ValueKind::I64(i) => Json::from(*i),
            ValueKind::I128(i) => i64::try_from(*i).map_or(Json::Null, Json::from),
            ValueKind::U64(u) => Json::from(*u),
            ValueKind::U128(u) => u64::try_from(*u).map_or(Json::Null, Json::from),
            ValueKind::Float(f) => Json::from(*f),
            ValueKind::String(s) => Json::String(Self::substitute_env_vars_in_string(s)),
            ValueKind::Table(table) => Json::Object(
                table
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::config_value_to_json(v)))
                    .collect(),
            ),
            ValueKind::Array(items) => {
                Json::Array(items.iter().map(Self::config_value_to_json).collect())
            }
        }
    }

    /// Add `{config_dir}/{name}.{toml,yaml,yml}` if one exists
    fn try_add_config_file(
        builder: &mut config::ConfigBuilder<config::builder::DefaultState>,
        config_dir: &str,
        name: &str,
    ) {
        for ext in ["toml", "yaml", "yml"] {
            let path = format!("{}/{}.{}", config_dir, name, ext);
            if Path::new(&path).exists() {
                tracing::info!("Loading config file: {}", path);
                *builder = builder
                    .clone()
                    .add_source(config::File::with_name(&format!("{}/{}", config_dir, name)));
                return;
            }
        }

        tracing::debug!(
            "Optional config file not found: {}/{}.{{toml,yaml,yml}}",
            config_dir,
            name
        );
    }

    /// Load settings from `$FLEETSCAN_CONFIG_DIR` (default: `config`) for
    /// `$FLEETSCAN_CONFIG_RUN_MODE` (default: `development`).
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode =
            env::var("FLEETSCAN_CONFIG_RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("FLEETSCAN_CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::load(&config_dir, &run_mode)
    }

    /// Load `default`, `{run_mode}` and `local` config files from
    /// `config_dir`, later files overriding earlier ones. Every file is
    /// optional; missing settings fall back to their defaults.
    pub fn load(config_dir: &str, run_mode: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        for name in ["default", run_mode, "local"] {
            Self::try_add_config_file(&mut builder, config_dir, name);
        }
        let config = builder.build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        // Deserialize from JSON value and collect unused fields
        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field: {}", field);
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.concurrency == 0 {
            return Err(ConfigError::Message(
                "discovery.concurrency must be at least 1".to_string(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(ConfigError::Message(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }

        match &self.backend {
            BackendSettings::Kubernetes {
                describe_batch_size,
                ..
            } if *describe_batch_size == 0 => Err(ConfigError::Message(
                "backend.describe_batch_size must be at least 1".to_string(),
            )),
            BackendSettings::Ecs {
                access_key_id,
                secret_access_key,
                ..
            } if is_set(access_key_id) != is_set(secret_access_key) => {
                Err(ConfigError::Message(
                    "backend.access_key_id and backend.secret_access_key must be set together"
                        .to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Origin tag for images delivered from `backend`
    pub fn origin(&self, backend: &str) -> String {
        self.delivery
            .origin
            .clone()
            .unwrap_or_else(|| backend.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn load_yaml(contents: &str) -> Result<Settings, ConfigError> {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("default.yaml"), contents).unwrap();
        Settings::load(temp_dir.path().to_str().unwrap(), "test")
    }

    #[test]
    fn test_substitute_env_vars_in_string_basic() {
        env::set_var("FLEETSCAN_TEST_VAR", "test_value");
        let result = Settings::substitute_env_vars_in_string("${FLEETSCAN_TEST_VAR}");
        assert_eq!(result, "test_value");
        env::remove_var("FLEETSCAN_TEST_VAR");
    }

    #[test]
    fn test_substitute_env_vars_in_string_with_default() {
        env::remove_var("FLEETSCAN_MISSING_VAR");
        let result = Settings::substitute_env_vars_in_string("${FLEETSCAN_MISSING_VAR:-eu-west-1}");
        assert_eq!(result, "eu-west-1");
    }

    #[test]
    fn test_substitute_env_vars_in_string_no_substitution() {
        let result = Settings::substitute_env_vars_in_string("plain_value");
        assert_eq!(result, "plain_value");
    }

    #[test]
    fn test_defaults_without_config_files() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings::load(temp_dir.path().to_str().unwrap(), "test").unwrap();

        assert_eq!(settings.discovery.concurrency, 16);
        assert_eq!(settings.discovery.reference_mode, ReferenceMode::RegistryAware);
        assert_eq!(settings.backend.name(), "kubernetes");
        assert_eq!(settings.delivery.max_attempts, 5);
        assert_eq!(settings.origin(settings.backend.name()), "kubernetes");
    }

    #[test]
    fn test_ecs_backend_from_yaml() {
        let settings = load_yaml(
            r#"
discovery:
  concurrency: 4
  reference_mode: legacy
backend:
  type: ecs
  region: us-east-1
delivery:
  origin: prod-ecs
"#,
        )
        .unwrap();

        assert_eq!(settings.discovery.concurrency, 4);
        assert_eq!(settings.discovery.reference_mode, ReferenceMode::Legacy);
        match &settings.backend {
            BackendSettings::Ecs { region, .. } => assert_eq!(region, "us-east-1"),
            other => panic!("unexpected backend {:?}", other),
        }
        assert_eq!(settings.origin("ecs"), "prod-ecs");
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let settings = load_yaml(
            r#"
discovery:
  concurrency: 2
  not_a_real_option: true
"#,
        )
        .unwrap();
        assert_eq!(settings.discovery.concurrency, 2);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        assert!(load_yaml("discovery:\n  concurrency: 0\n").is_err());
    }

    #[test]
    fn test_rejects_half_static_credentials() {
        let result = load_yaml(
            r#"
backend:
  type: ecs
  access_key_id: AKIA123
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_local_overrides_default() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("default.toml"),
            "[discovery]\nconcurrency = 8\n",
        )
        .unwrap();
        fs::write(
            temp_dir.path().join("local.toml"),
            "[discovery]\nconcurrency = 3\n",
        )
        .unwrap();

        let settings = Settings::load(temp_dir.path().to_str().unwrap(), "test").unwrap();
        assert_eq!(settings.discovery.concurrency, 3);
    }

    #[test]
    fn test_env_vars_expanded_inside_nested_values() {
        env::remove_var("FLEETSCAN_TEST_UNSET_NS");
        let settings = load_yaml(
            r#"
backend:
  type: kubernetes
  namespaces: ["${FLEETSCAN_TEST_UNSET_NS:-payments}", "static"]
discovery:
  concurrency: 4
"#,
        )
        .unwrap();

        match settings.backend {
            BackendSettings::Kubernetes { namespaces, .. } => {
                assert_eq!(namespaces, vec!["payments", "static"]);
            }
            other => panic!("unexpected backend: {other:?}"),
        }
        assert_eq!(settings.discovery.concurrency, 4);
    }
}

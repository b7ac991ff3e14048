use async_trait::async_trait;
use base64::Engine;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::DiscoveryError;

/// Registry credentials resolved for one image.
///
/// The zero value (all fields empty) means "no credentials", which is the
/// normal outcome for public images.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialRecord {
    /// Registry the credentials apply to; empty means any registry
    pub registry_domain: String,
    pub username: String,
    pub password: String,
    /// Identity or registry token, when the registry issues one
    pub token: String,
}

impl CredentialRecord {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty() && self.token.is_empty()
    }

    /// Whether these credentials may be sent to `domain`.
    pub fn applies_to(&self, domain: &str) -> bool {
        self.registry_domain.is_empty()
            || normalize_registry_host(&self.registry_domain) == normalize_registry_host(domain)
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("registry_domain", &self.registry_domain)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("token", &redacted(&self.token))
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

/// Opaque pointer to the secret(s) that may hold pull credentials for a
/// container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRef {
    /// Backend-specific scope, e.g. the Kubernetes namespace
    pub scope: Option<String>,
    /// Candidate secrets, tried in order
    pub secrets: Vec<String>,
}

impl CredentialRef {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            scope: None,
            secrets: vec![secret.into()],
        }
    }

    pub fn scoped(scope: impl Into<String>, secrets: Vec<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            secrets,
        }
    }
}

/// Backing store for registry pull secrets
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the raw secret payload.
    ///
    /// A [`DiscoveryError`] returned inside the `anyhow::Error` is reported
    /// as is; anything else becomes `SecretUnavailable`.
    async fn get_secret(&self, scope: Option<&str>, name: &str) -> anyhow::Result<Vec<u8>>;
}

/// Decode every credential entry in a registry secret.
///
/// Two shapes are accepted:
///
/// ```json
/// {"auths": {"registry.example.com": {"username": "u", "password": "p"}}}
/// ```
///
/// ```json
/// {"username": "u", "password": "p"}
/// ```
///
/// The first is scoped to the registry named by its key, the second applies
/// to any registry. Entries without credentials decode to the zero record.
pub fn decode_registry_auths(blob: &[u8]) -> Result<Vec<CredentialRecord>, String> {
    let root: Value =
        serde_json::from_slice(blob).map_err(|e| format!("secret is not valid JSON: {}", e))?;
    let root = root
        .as_object()
        .ok_or_else(|| "expected a JSON object".to_string())?;

    match root.get("auths") {
        Some(Value::Object(auths)) => auths
            .iter()
            .map(|(domain, entry)| {
                let entry = entry
                    .as_object()
                    .ok_or_else(|| format!("auth entry for {} is not an object", domain))?;
                decode_entry(entry, domain)
            })
            .collect(),
        Some(_) => Err("\"auths\" is not an object".to_string()),
        None => Ok(vec![decode_entry(root, "")?]),
    }
}

/// Decode the first credential entry of a registry secret, or the zero
/// record when it holds none.
pub fn decode_registry_auth(blob: &[u8]) -> Result<CredentialRecord, String> {
    Ok(decode_registry_auths(blob)?
        .into_iter()
        .next()
        .unwrap_or_default())
}

fn decode_entry(entry: &Map<String, Value>, domain: &str) -> Result<CredentialRecord, String> {
    let mut username = string_field(entry, "username")?;
    let mut password = string_field(entry, "password")?;

    // Docker config files often only carry base64("user:pass")
    if username.is_none() && password.is_none() {
        if let Some(auth) = string_field(entry, "auth")? {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth.trim())
                .map_err(|e| format!("\"auth\" is not valid base64: {}", e))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| "\"auth\" is not valid UTF-8".to_string())?;
            if let Some((user, pass)) = decoded.split_once(':') {
                username = Some(user.to_string());
                password = Some(pass.to_string());
            }
        }
    }

    let token = match string_field(entry, "identitytoken")? {
        Some(token) => Some(token),
        None => string_field(entry, "registrytoken")?,
    };

    match (username, password) {
        (Some(username), Some(password)) => Ok(CredentialRecord {
            registry_domain: domain.to_string(),
            username,
            password,
            token: token.unwrap_or_default(),
        }),
        _ => Ok(CredentialRecord::default()),
    }
}

fn string_field(entry: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match entry.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(format!("\"{}\" is not a string", key)),
    }
}

/// Reduce a docker-config style key (`https://index.docker.io/v1/`) to a
/// bare host name, mapping Docker Hub aliases onto `docker.io`.
pub fn normalize_registry_host(domain: &str) -> &str {
    let host = domain
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or(domain);
    let host = host.split(':').next().unwrap_or(host);
    match host {
        "" | "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => "docker.io",
        other => other,
    }
}

/// Resolves credential references into credential records.
pub struct CredentialResolver {
    store: Arc<dyn SecretStore>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Resolve the credentials for an image hosted on `registry_domain`.
    ///
    /// An absent reference short-circuits to the zero record without touching
    /// the store. Otherwise each referenced secret is fetched and decoded in
    /// order, and the first entry that applies to `registry_domain` wins. No
    /// matching entry is not an error.
    pub async fn resolve(
        &self,
        reference: Option<&CredentialRef>,
        registry_domain: &str,
    ) -> Result<CredentialRecord, DiscoveryError> {
        let Some(reference) = reference else {
            return Ok(CredentialRecord::default());
        };
        let scope = reference.scope.as_deref();

        for secret in &reference.secrets {
            let label = match scope {
                Some(scope) => format!("{}/{}", scope, secret),
                None => secret.clone(),
            };
            let blob = self
                .store
                .get_secret(scope, secret)
                .await
                .map_err(|e| match e.downcast::<DiscoveryError>() {
                    Ok(err) => err,
                    Err(e) => DiscoveryError::secret(label.clone(), e),
                })?;
            let entries =
                decode_registry_auths(&blob).map_err(|e| DiscoveryError::decode(label.clone(), e))?;

            if let Some(found) = entries
                .into_iter()
                .find(|entry| !entry.is_empty() && entry.applies_to(registry_domain))
            {
                debug!(secret = %label, registry = %found.registry_domain, "Resolved registry credentials");
                return Ok(found);
            }
            debug!(secret = %label, registry = %registry_domain, "Secret holds no credentials for registry");
        }

        Ok(CredentialRecord::default())
    }
}

pub mod credentials;
pub mod reference;

pub use credentials::{
    decode_registry_auth, decode_registry_auths, CredentialRecord, CredentialRef,
    CredentialResolver, SecretStore,
};
pub use reference::{ImageReference, ReferenceMode};

use std::fmt;

/// A container image discovered in the fleet, ready to be handed to a
/// scanner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRecord {
    pub name: String,
    /// Empty when the image is pinned by digest or untagged
    pub tag: String,
    /// Empty unless the locator pinned a digest
    pub digest: String,
    pub credential: CredentialRecord,
}

impl ImageRecord {
    pub fn from_reference(reference: ImageReference, credential: CredentialRecord) -> Self {
        Self {
            name: reference.name,
            tag: reference.tag,
            digest: reference.digest,
            credential,
        }
    }

    /// Host of the registry serving this image, empty for implicit Docker Hub
    /// names.
    pub fn registry_domain(&self) -> &str {
        reference::registry_domain(&self.name)
    }
}

impl fmt::Display for ImageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.tag.is_empty() {
            write!(f, ":{}", self.tag)?;
        }
        if !self.digest.is_empty() {
            write!(f, "@{}", self.digest)?;
        }
        Ok(())
    }
}

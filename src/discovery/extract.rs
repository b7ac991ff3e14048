use tracing::{debug, warn};

use super::Descriptor;
use crate::error::DiscoveryError;
use crate::image::{reference, CredentialResolver, ImageRecord, ImageReference, ReferenceMode};

/// Images and per-container failures produced from one descriptor.
#[derive(Debug, Default)]
pub struct Extraction {
    pub images: Vec<ImageRecord>,
    pub errors: Vec<DiscoveryError>,
}

/// Turns descriptors into image records. Shared by batch and stream mode.
pub struct ImageExtractor {
    resolver: CredentialResolver,
    mode: ReferenceMode,
}

impl ImageExtractor {
    pub fn new(resolver: CredentialResolver, mode: ReferenceMode) -> Self {
        Self { resolver, mode }
    }

    /// Extract one image record per container spec, in declared order.
    ///
    /// A failure for one container (unparseable locator, unavailable or
    /// malformed credentials) drops only that container's record.
    pub async fn extract(&self, descriptor: &Descriptor) -> Extraction {
        let mut extraction = Extraction::default();

        for container in &descriptor.containers {
            let parsed = ImageReference::parse(&container.image, self.mode);
            if parsed.name.is_empty() {
                warn!(
                    group = %descriptor.group,
                    member = %descriptor.member,
                    container = %container.name,
                    "Container has no usable image reference"
                );
                extraction.errors.push(DiscoveryError::InvalidReference {
                    locator: container.image.clone(),
                });
                continue;
            }

            let domain = reference::registry_domain(&parsed.name);
            match self
                .resolver
                .resolve(container.credential_ref.as_ref(), domain)
                .await
            {
                Ok(credential) => {
                    let image = ImageRecord::from_reference(parsed, credential);
                    debug!(member = %descriptor.member, image = %image, "Extracted image");
                    extraction.images.push(image);
                }
                Err(e) => {
                    warn!(
                        member = %descriptor.member,
                        container = %container.name,
                        error = %e,
                        "Failed to resolve pull credentials"
                    );
                    extraction.errors.push(e);
                }
            }
        }

        extraction
    }
}

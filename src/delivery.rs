use async_trait::async_trait;
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::image::ImageRecord;
use crate::settings::DeliverySettings;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The consumer could not be reached. Worth retrying.
    #[error("consumer unavailable: {0}")]
    Unavailable(String),

    /// The consumer refused the image. Retrying will not help.
    #[error("consumer rejected image: {0}")]
    Rejected(String),
}

/// Consumer of discovered images (scanner queue, stdout, ...)
#[async_trait]
pub trait ImageSink: Send + Sync {
    /// Hand one image to the consumer, tagged with the fleet it came from.
    async fn deliver(&self, origin: &str, image: &ImageRecord) -> Result<(), DeliveryError>;
}

/// Retries `Unavailable` deliveries with a linear backoff.
pub struct RetryingSink<S> {
    inner: S,
    max_attempts: u32,
    backoff: Duration,
}

impl<S: ImageSink> RetryingSink<S> {
    pub fn new(inner: S, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_settings(inner: S, settings: &DeliverySettings) -> Self {
        Self::new(
            inner,
            settings.max_attempts,
            Duration::from_millis(settings.backoff_ms),
        )
    }
}

#[async_trait]
impl<S: ImageSink> ImageSink for RetryingSink<S> {
    async fn deliver(&self, origin: &str, image: &ImageRecord) -> Result<(), DeliveryError> {
        let mut attempt = 1;
        loop {
            match self.inner.deliver(origin, image).await {
                Err(DeliveryError::Unavailable(reason)) if attempt < self.max_attempts => {
                    let wait = self.backoff * attempt;
                    warn!(
                        image = %image,
                        attempt,
                        "Delivery failed ({}), retrying in {:?}",
                        reason,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn is_blank(value: &&str) -> bool {
    value.is_empty()
}

/// JSON view of a delivered image. Carries no secret values.
#[derive(Debug, Serialize)]
struct DeliveredImage<'a> {
    origin: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    tag: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    digest: &'a str,
    reference: String,
    #[serde(skip_serializing_if = "is_blank")]
    registry_domain: &'a str,
    authenticated: bool,
}

impl<'a> DeliveredImage<'a> {
    fn new(origin: &'a str, image: &'a ImageRecord) -> Self {
        Self {
            origin,
            name: &image.name,
            tag: &image.tag,
            digest: &image.digest,
            reference: image.to_string(),
            registry_domain: image.registry_domain(),
            authenticated: !image.credential.is_empty(),
        }
    }
}

/// Writes one JSON object per image, one per line.
pub struct JsonLinesSink<W> {
    out: Mutex<W>,
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl<W: Write + Send> ImageSink for JsonLinesSink<W> {
    async fn deliver(&self, origin: &str, image: &ImageRecord) -> Result<(), DeliveryError> {
        let line = serde_json::to_string(&DeliveredImage::new(origin, image))
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;

        let mut out = self
            .out
            .lock()
            .map_err(|_| DeliveryError::Unavailable("output lock poisoned".to_string()))?;
        writeln!(out, "{}", line)
            .and_then(|_| out.flush())
            .map_err(|e| DeliveryError::Unavailable(e.to_string()))?;

        debug!(image = %image, "Delivered image");
        Ok(())
    }
}

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fleetscan::backends::{Backend, BackendRegistry};
use fleetscan::delivery::{ImageSink, JsonLinesSink, RetryingSink};
use fleetscan::discovery::{DiscoveryPipeline, ImageExtractor};
use fleetscan::image::{CredentialResolver, ImageRecord};
use fleetscan::settings::Settings;

/// Everything a discovery command needs, wired from settings
struct Runtime {
    settings: Settings,
    backend: Backend,
    origin: String,
    sink: RetryingSink<JsonLinesSink<std::io::Stdout>>,
}

impl Runtime {
    async fn connect(registry: &BackendRegistry, backend_name: Option<&str>) -> Result<Self> {
        let settings = Settings::new()?;
        let name = backend_name.unwrap_or(settings.backend.name());
        let backend = registry.build(name, &settings).await?;
        let origin = settings.origin(name);
        let sink = RetryingSink::from_settings(JsonLinesSink::stdout(), &settings.delivery);
        Ok(Self {
            settings,
            backend,
            origin,
            sink,
        })
    }

    fn extractor(&self) -> ImageExtractor {
        ImageExtractor::new(
            CredentialResolver::new(self.backend.secrets.clone()),
            self.settings.discovery.reference_mode,
        )
    }

    fn pipeline(&self) -> DiscoveryPipeline {
        DiscoveryPipeline::new(
            self.backend.fleet.clone(),
            self.extractor(),
            self.settings.discovery.concurrency,
        )
    }

    async fn deliver_all(&self, images: &[ImageRecord]) -> usize {
        let mut failed = 0;
        for image in images {
            if let Err(e) = self.sink.deliver(&self.origin, image).await {
                error!(image = %image, "Failed to deliver image: {}", e);
                failed += 1;
            }
        }
        failed
    }
}

/// Run one batch discovery and print every image found.
pub async fn discover(
    registry: &BackendRegistry,
    backend_name: Option<&str>,
    strict: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let runtime = Runtime::connect(registry, backend_name).await?;
    let report = runtime.pipeline().discover_once(&cancel).await;

    let failed = runtime.deliver_all(&report.images).await;

    if let Some(aggregated) = &report.error {
        for e in aggregated.errors() {
            warn!("{}", e);
        }
    }
    info!(
        "Delivered {} of {} image(s), {} discovery error(s)",
        report.images.len() - failed,
        report.images.len(),
        report.error.as_ref().map_or(0, |e| e.len())
    );

    if failed > 0 {
        bail!("{} image(s) could not be delivered", failed);
    }
    if strict {
        report.into_result()?;
    }
    Ok(())
}

/// Follow the backend's change feed until interrupted.
pub async fn watch(
    registry: &BackendRegistry,
    backend_name: Option<&str>,
    cancel: CancellationToken,
) -> Result<()> {
    let runtime = Arc::new(Runtime::connect(registry, backend_name).await?);
    let (image_tx, mut image_rx) = mpsc::unbounded_channel::<ImageRecord>();

    let delivery = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            while let Some(image) = image_rx.recv().await {
                runtime.deliver_all(std::slice::from_ref(&image)).await;
            }
        })
    };

    let result = runtime
        .pipeline()
        .discover_continuously(
            cancel,
            move |image| {
                // Receiver only goes away when the delivery task panicked
                let _ = image_tx.send(image);
            },
            |e| warn!("{}", e),
        )
        .await;

    // The sender was moved into the closure and is dropped with it, which
    // lets the delivery task drain and exit.
    delivery.await.context("delivery task failed")?;
    result?;
    info!("Watch stopped");
    Ok(())
}

/// Extract images for one ECS task state change event read from `path`
/// (`-` for stdin).
#[cfg(feature = "ecs")]
pub async fn ecs_event(path: &str) -> Result<()> {
    use fleetscan::backends::ecs::EcsFactory;
    use std::io::Read;

    let raw = if path == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read event from stdin")?;
        raw
    } else {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?
    };
    let event: serde_json::Value = serde_json::from_str(&raw).context("Event is not valid JSON")?;

    let settings = Settings::new()?;
    let (backend, secrets) = EcsFactory::connect(&settings).await?;
    let extractor = ImageExtractor::new(
        CredentialResolver::new(Arc::new(secrets)),
        settings.discovery.reference_mode,
    );
    let extraction = backend.images_for_task_event(&event, &extractor).await?;

    let origin = settings.origin("ecs");
    let sink = RetryingSink::from_settings(JsonLinesSink::stdout(), &settings.delivery);
    for image in &extraction.images {
        sink.deliver(&origin, image).await?;
    }
    for e in &extraction.errors {
        warn!("{}", e);
    }
    if !extraction.errors.is_empty() {
        bail!(
            "{} container(s) of the task could not be processed",
            extraction.errors.len()
        );
    }
    Ok(())
}

pub fn check_config() -> Result<()> {
    println!("Checking configuration...");
    match Settings::new() {
        Ok(settings) => {
            println!("✓ Configuration is valid (backend: {})", settings.backend.name());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

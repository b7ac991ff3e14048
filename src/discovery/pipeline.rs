use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::watch::run_watch;
use super::{chunk_label, split_into_chunks, Descriptor, FleetBackend, Group, ImageExtractor, MemberId};
use crate::error::{AggregatedError, DiscoveryError};
use crate::image::ImageRecord;

/// Outcome of a batch discovery run: every image that could be produced
/// plus every error observed on the way.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub images: Vec<ImageRecord>,
    pub error: Option<AggregatedError>,
}

impl DiscoveryReport {
    fn failed(error: DiscoveryError) -> Self {
        Self {
            images: Vec::new(),
            error: Some(AggregatedError::new(vec![error])),
        }
    }

    /// Treat any observed error as fatal, discarding partial results.
    pub fn into_result(self) -> Result<Vec<ImageRecord>, AggregatedError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.images),
        }
    }
}

/// Drives discovery against one backend, in batch or stream mode.
pub struct DiscoveryPipeline {
    backend: Arc<dyn FleetBackend>,
    extractor: Arc<ImageExtractor>,
    concurrency: usize,
}

impl DiscoveryPipeline {
    /// `concurrency` caps the number of backend calls in flight at once.
    pub fn new(
        backend: Arc<dyn FleetBackend>,
        extractor: ImageExtractor,
        concurrency: usize,
    ) -> Self {
        Self {
            backend,
            extractor: Arc::new(extractor),
            concurrency: concurrency.max(1),
        }
    }

    /// Take one snapshot of every image deployed in the fleet.
    ///
    /// Groups, chunks of members and descriptors are processed concurrently;
    /// a failure in one branch is recorded and the remaining branches carry
    /// on. Once `cancel` fires no new work is started, in-flight backend calls
    /// are abandoned, and the report carries a `Cancelled` error alongside
    /// whatever was collected.
    pub async fn discover_once(&self, cancel: &CancellationToken) -> DiscoveryReport {
        let started = Instant::now();
        let backend_name = self.backend.name();
        info!(backend = backend_name, "Starting image discovery");

        debug!(state = "enumerating", "Listing groups");
        let groups = tokio::select! {
            _ = cancel.cancelled() => return DiscoveryReport::failed(DiscoveryError::Cancelled),
            groups = self.backend.list_groups() => groups,
        };
        let groups = match groups {
            Ok(groups) => groups,
            Err(e) => {
                error!(backend = backend_name, error = %e, "Failed to list groups, aborting run");
                return DiscoveryReport::failed(e);
            }
        };
        info!(backend = backend_name, groups = groups.len(), "Listed groups");

        let (image_tx, mut image_rx) = mpsc::unbounded_channel();
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        let run = RunContext {
            backend: self.backend.clone(),
            extractor: self.extractor.clone(),
            permits: Arc::new(Semaphore::new(self.concurrency)),
            tracker: TaskTracker::new(),
            cancel: cancel.clone(),
            images: image_tx,
            errors: error_tx,
        };

        debug!(state = "fanning_out", concurrency = self.concurrency, "Spawning group tasks");
        for group in groups {
            if cancel.is_cancelled() {
                break;
            }
            run.spawn_group(group);
        }

        run.tracker.close();
        run.tracker.wait().await;
        debug!(state = "draining", "All discovery tasks finished");

        // Release the last senders so the receivers terminate.
        drop(run);
        let mut images = Vec::new();
        while let Some(image) = image_rx.recv().await {
            images.push(image);
        }
        let mut errors = Vec::new();
        while let Some(err) = error_rx.recv().await {
            errors.push(err);
        }
        if cancel.is_cancelled() {
            errors.push(DiscoveryError::Cancelled);
        }

        info!(
            backend = backend_name,
            images = images.len(),
            errors = errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image discovery finished"
        );
        debug!(state = "done");

        DiscoveryReport {
            images,
            error: (!errors.is_empty()).then(|| AggregatedError::new(errors)),
        }
    }

    /// Follow the backend's change feed, extracting images for every member
    /// that is added or updated, until `cancel` fires.
    ///
    /// Returns an error only when the subscription cannot be established.
    /// Errors while streaming go to `on_error` and do not end the watch.
    pub async fn discover_continuously<I, E>(
        &self,
        cancel: CancellationToken,
        on_image: I,
        on_error: E,
    ) -> Result<(), DiscoveryError>
    where
        I: FnMut(ImageRecord),
        E: FnMut(DiscoveryError),
    {
        let events = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            events = self.backend.subscribe() => events?,
        };
        run_watch(
            self.backend.as_ref(),
            &self.extractor,
            events,
            cancel,
            on_image,
            on_error,
        )
        .await;
        Ok(())
    }
}

/// State shared by every task of one batch run. Cloned into each task; the
/// channels close once the last clone is dropped.
#[derive(Clone)]
struct RunContext {
    backend: Arc<dyn FleetBackend>,
    extractor: Arc<ImageExtractor>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    images: mpsc::UnboundedSender<ImageRecord>,
    errors: mpsc::UnboundedSender<DiscoveryError>,
}

impl RunContext {
    /// Wait for a concurrency permit, or `None` if the run was cancelled.
    async fn acquire(&self) -> Option<SemaphorePermit<'_>> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            permit = self.permits.acquire() => permit.ok(),
        }
    }

    fn report(&self, error: DiscoveryError) {
        // The receiver outlives every task of the run.
        let _ = self.errors.send(error);
    }

    fn spawn_group(&self, group: Group) {
        let run = self.clone();
        self.tracker.spawn(async move {
            let Some(permit) = run.acquire().await else {
                return;
            };
            let members = tokio::select! {
                _ = run.cancel.cancelled() => return,
                members = run.backend.list_members(&group) => members,
            };
            drop(permit);

            let members = match members {
                Ok(members) => members,
                Err(e) => {
                    warn!(group = %group, error = %e, "Failed to list members, skipping group");
                    run.report(e);
                    return;
                }
            };

            let chunks = split_into_chunks(&members, run.backend.batch_limit());
            debug!(
                group = %group,
                members = members.len(),
                chunks = chunks.len(),
                "Split members into chunks"
            );
            for chunk in chunks {
                if run.cancel.is_cancelled() {
                    return;
                }
                run.spawn_chunk(group.clone(), chunk);
            }
        });
    }

    fn spawn_chunk(&self, group: Group, members: Vec<MemberId>) {
        let run = self.clone();
        self.tracker.spawn(async move {
            let Some(permit) = run.acquire().await else {
                return;
            };
            let described = tokio::select! {
                _ = run.cancel.cancelled() => return,
                described = run.backend.describe(&group, &members) => described,
            };
            drop(permit);

            let descriptors = match described {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    warn!(
                        chunk = %chunk_label(&group, &members),
                        error = %e,
                        "Failed to describe chunk, skipping it"
                    );
                    run.report(e);
                    return;
                }
            };

            for descriptor in descriptors {
                if run.cancel.is_cancelled() {
                    return;
                }
                run.spawn_extraction(descriptor);
            }
        });
    }

    fn spawn_extraction(&self, descriptor: Descriptor) {
        let run = self.clone();
        self.tracker.spawn(async move {
            let Some(_permit) = run.acquire().await else {
                return;
            };
            let extraction = tokio::select! {
                _ = run.cancel.cancelled() => return,
                extraction = run.extractor.extract(&descriptor) => extraction,
            };
            for image in extraction.images {
                let _ = run.images.send(image);
            }
            for err in extraction.errors {
                run.report(err);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::testing::{container, FakeBackend, FakeSecretStore};
    use crate::discovery::{MemberChange, MemberEvent};
    use crate::image::{CredentialRef, CredentialResolver, ReferenceMode};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    fn pipeline(backend: FakeBackend, store: FakeSecretStore, concurrency: usize) -> DiscoveryPipeline {
        let extractor = ImageExtractor::new(
            CredentialResolver::new(Arc::new(store)),
            ReferenceMode::RegistryAware,
        );
        DiscoveryPipeline::new(Arc::new(backend), extractor, concurrency)
    }

    fn image_names(report: &DiscoveryReport) -> HashSet<String> {
        report.images.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_two_groups_twelve_and_zero_members() {
        let backend = FakeBackend::new(10).with_group("group1", 12).with_group("group2", 0);
        let calls = backend.describe_calls();
        let pipeline = pipeline(backend, FakeSecretStore::default(), 8);

        let report = pipeline.discover_once(&CancellationToken::new()).await;

        assert!(report.error.is_none(), "{:?}", report.error);
        assert_eq!(report.images.len(), 12);
        assert_eq!(image_names(&report).len(), 12, "duplicates in {:?}", report.images);

        let mut sizes: Vec<usize> = calls.lock().unwrap().iter().map(|(_, n)| *n).collect();
        sizes.sort();
        assert_eq!(sizes, vec![2, 10]);
        assert!(calls.lock().unwrap().iter().all(|(g, _)| g == "group1"));
    }

    #[tokio::test]
    async fn test_failed_chunk_is_isolated() {
        // 40 members -> 4 chunks; the third one fails.
        let backend = FakeBackend::new(10)
            .with_group("cluster", 40)
            .fail_describe_containing("cluster-m-25");
        let pipeline = pipeline(backend, FakeSecretStore::default(), 4);

        let report = pipeline.discover_once(&CancellationToken::new()).await;

        assert_eq!(report.images.len(), 30);
        let error = report.error.expect("chunk failure should be reported");
        assert_eq!(error.len(), 1);
        match &error.errors()[0] {
            DiscoveryError::BackendUnavailable { target, .. } => {
                assert!(target.contains("cluster-m-25"), "target was {}", target);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_credential_decode_failure_keeps_siblings() {
        let backend = FakeBackend::new(10).with_descriptor(
            "cluster",
            "svc",
            vec![
                container("web", "nginx:1.25", None),
                container("app", "private.example.com/app:1", Some(CredentialRef::new("arn:bad"))),
                container("cache", "redis:7", None),
            ],
        );
        let store = FakeSecretStore::default().with_secret("arn:bad", "{{{");
        let pipeline = pipeline(backend, store, 4);

        let report = pipeline.discover_once(&CancellationToken::new()).await;

        assert_eq!(
            image_names(&report),
            HashSet::from(["nginx:1.25".to_string(), "redis:7".to_string()])
        );
        let error = report.error.unwrap();
        assert_eq!(error.len(), 1);
        assert!(matches!(error.errors()[0], DiscoveryError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_member_listing_failure_aborts_only_that_group() {
        let backend = FakeBackend::new(10)
            .with_group("healthy", 3)
            .with_group("broken", 5)
            .fail_list_members("broken");
        let pipeline = pipeline(backend, FakeSecretStore::default(), 4);

        let report = pipeline.discover_once(&CancellationToken::new()).await;

        assert_eq!(report.images.len(), 3);
        assert_eq!(report.error.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_group_listing_failure_aborts_run() {
        let backend = FakeBackend::new(10).with_group("g", 3).fail_list_groups();
        let pipeline = pipeline(backend, FakeSecretStore::default(), 4);

        let report = pipeline.discover_once(&CancellationToken::new()).await;

        assert!(report.images.is_empty());
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let backend = FakeBackend::new(2)
            .with_group("a", 20)
            .with_group("b", 20)
            .with_latency(Duration::from_millis(5));
        let peak = backend.peak_in_flight();
        let pipeline = pipeline(backend, FakeSecretStore::default(), 3);

        let report = pipeline.discover_once(&CancellationToken::new()).await;

        assert_eq!(report.images.len(), 40);
        let peak = peak.load(std::sync::atomic::Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 3, "peak in-flight calls was {}", peak);
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_cancellation() {
        let backend = FakeBackend::new(10)
            .with_group("g", 30)
            .with_latency(Duration::from_millis(200));
        let pipeline = pipeline(backend, FakeSecretStore::default(), 4);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let report = tokio::time::timeout(Duration::from_secs(5), pipeline.discover_once(&cancel))
            .await
            .expect("cancelled run should finish promptly");

        let error = report.error.expect("cancellation should be reported");
        assert!(error
            .errors()
            .iter()
            .any(|e| matches!(e, DiscoveryError::Cancelled)));
    }

    #[tokio::test]
    async fn test_watch_emits_images_and_survives_errors() {
        let backend = FakeBackend::new(10).with_group("ns", 1);
        let feed = backend.event_feed();
        let pipeline = pipeline(backend, FakeSecretStore::default(), 4);
        let cancel = CancellationToken::new();

        let images = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (sink_images, sink_errors) = (images.clone(), errors.clone());
        let watcher_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            pipeline
                .discover_continuously(
                    watcher_cancel,
                    move |image| sink_images.lock().unwrap().push(image),
                    move |err| sink_errors.lock().unwrap().push(err.to_string()),
                )
                .await
        });

        // Pre-resolved descriptor, then one that must be described, then a feed error.
        feed.send(Ok(MemberEvent::Added(MemberChange {
            group: "ns".into(),
            member: "pod-a".into(),
            descriptor: Some(crate::discovery::testing::descriptor(
                "ns",
                "pod-a",
                vec![container("main", "ghcr.io/org/a:1", None)],
            )),
        })))
        .unwrap();
        feed.send(Err(DiscoveryError::backend("watch", "pods", anyhow::anyhow!("410 Gone"))))
            .unwrap();
        feed.send(Ok(MemberEvent::Updated(MemberChange {
            group: "ns".into(),
            member: "ns-m-0".into(),
            descriptor: None,
        })))
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while images.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watch should deliver both images");

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watch should stop after cancellation")
            .unwrap();
        assert!(result.is_ok());

        let names: Vec<String> = images.lock().unwrap().iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["ghcr.io/org/a:1", "registry.example.com/ns-m-0:1.0"]);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_unsupported_backend() {
        let backend = FakeBackend::new(10).without_watch();
        let pipeline = pipeline(backend, FakeSecretStore::default(), 1);

        let result = pipeline
            .discover_continuously(CancellationToken::new(), |_| {}, |_| {})
            .await;

        assert!(matches!(result, Err(DiscoveryError::Unsupported(_))));
    }

    /// Secret store whose lookups never complete.
    struct StalledSecretStore;

    #[async_trait::async_trait]
    impl crate::image::SecretStore for StalledSecretStore {
        async fn get_secret(&self, _scope: Option<&str>, _name: &str) -> anyhow::Result<Vec<u8>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_watch_cancel_interrupts_stalled_extraction() {
        let backend = FakeBackend::new(10).with_group("ns", 0);
        let feed = backend.event_feed();
        let extractor = ImageExtractor::new(
            CredentialResolver::new(Arc::new(StalledSecretStore)),
            ReferenceMode::RegistryAware,
        );
        let pipeline = DiscoveryPipeline::new(Arc::new(backend), extractor, 1);
        let cancel = CancellationToken::new();

        feed.send(Ok(MemberEvent::Added(MemberChange {
            group: "ns".into(),
            member: "pod-a".into(),
            descriptor: Some(crate::discovery::testing::descriptor(
                "ns",
                "pod-a",
                vec![container(
                    "main",
                    "registry.example.com/a:1",
                    Some(CredentialRef::scoped("ns", vec!["pull".to_string()])),
                )],
            )),
        })))
        .unwrap();

        let watcher_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            pipeline
                .discover_continuously(watcher_cancel, |_| {}, |_| {})
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watch should return promptly once cancelled")
            .unwrap();
        assert!(result.is_ok());
    }
}

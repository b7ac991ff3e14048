use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Descriptor, FleetBackend, Group, ImageExtractor, MemberId};
use crate::error::DiscoveryError;
use crate::image::ImageRecord;

/// Stream of member lifecycle events from a backend change feed
pub type MemberEventStream = BoxStream<'static, Result<MemberEvent, DiscoveryError>>;

/// A member that appeared or changed.
#[derive(Debug, Clone)]
pub struct MemberChange {
    pub group: Group,
    pub member: MemberId,
    /// Present when the feed already delivers the full object; otherwise the
    /// member is described on receipt.
    pub descriptor: Option<Descriptor>,
}

#[derive(Debug, Clone)]
pub enum MemberEvent {
    Added(MemberChange),
    Updated(MemberChange),
}

impl MemberEvent {
    pub fn change(&self) -> &MemberChange {
        match self {
            MemberEvent::Added(change) | MemberEvent::Updated(change) => change,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            MemberEvent::Added(_) => "added",
            MemberEvent::Updated(_) => "updated",
        }
    }
}

/// Consume `events` until cancelled or the feed ends, extracting images for
/// each event as it arrives.
///
/// Errors from the feed or from extraction are reported through `on_error`
/// and never stop the loop.
pub(crate) async fn run_watch<I, E>(
    backend: &dyn FleetBackend,
    extractor: &ImageExtractor,
    mut events: MemberEventStream,
    cancel: CancellationToken,
    mut on_image: I,
    mut on_error: E,
) where
    I: FnMut(ImageRecord),
    E: FnMut(DiscoveryError),
{
    info!(backend = backend.name(), "Watching for member changes");

    'events: loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                info!(backend = backend.name(), "Watch cancelled, closing subscription");
                break;
            }
            event = events.next() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(error = %e, "Change feed reported an error");
                on_error(e);
                continue;
            }
            None => {
                warn!(backend = backend.name(), "Change feed ended");
                break;
            }
        };

        let change = event.change();
        debug!(
            kind = event.kind(),
            group = %change.group,
            member = %change.member,
            "Received member event"
        );

        let descriptors = match &change.descriptor {
            Some(descriptor) => vec![descriptor.clone()],
            None => {
                let members = std::slice::from_ref(&change.member);
                let described = tokio::select! {
                    _ = cancel.cancelled() => break,
                    described = backend.describe(&change.group, members) => described,
                };
                match described {
                    Ok(descriptors) => descriptors,
                    Err(e) => {
                        on_error(e);
                        continue;
                    }
                }
            }
        };

        for descriptor in &descriptors {
            let extraction = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(backend = backend.name(), "Watch cancelled during extraction");
                    break 'events;
                }
                extraction = extractor.extract(descriptor) => extraction,
            };
            extraction.images.into_iter().for_each(&mut on_image);
            extraction.errors.into_iter().for_each(&mut on_error);
        }
    }

    // Dropping the stream tears down the backend subscription.
    drop(events);
}

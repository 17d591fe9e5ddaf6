//! Structured events emitted while operations converge.
//!
//! Every retry, poll, page fetch and tag change is reported to an
//! [`Observer`]. The default [`TracingObserver`] turns them into `tracing`
//! events; callers can plug in their own sink (metrics, audit log, tests).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::classify::Classification;

/// Something that happened inside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    AttemptFailed {
        operation: String,
        attempt: u32,
        elapsed: Duration,
        classification: Classification,
        error: String,
    },
    RetryScheduled {
        operation: String,
        attempt: u32,
        delay: Duration,
    },
    Polled {
        id: String,
        probe: u32,
        /// `None` when the resource was not found.
        status: Option<String>,
        elapsed: Duration,
    },
    PageFetched {
        page: u32,
        raw: usize,
        kept: usize,
        last: bool,
    },
    TagsRemoved {
        keys: Vec<String>,
    },
    TagsCreated {
        keys: Vec<String>,
    },
}

/// Receiver of engine events.
pub trait Observer: Send + Sync {
    fn observe(&self, event: &Event);
}

impl<F> Observer for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn observe(&self, event: &Event) {
        self(event)
    }
}

/// Logs engine events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn observe(&self, event: &Event) {
        match event {
            Event::AttemptFailed {
                operation,
                attempt,
                elapsed,
                classification: Classification::Fatal,
                error,
            } => {
                warn!(
                    operation = %operation,
                    attempt,
                    elapsed_ms = elapsed.as_millis(),
                    error = %error,
                    "Attempt failed fatally"
                )
            }
            Event::AttemptFailed {
                operation,
                attempt,
                elapsed,
                classification,
                error,
            } => {
                debug!(
                    operation = %operation,
                    attempt,
                    elapsed_ms = elapsed.as_millis(),
                    ?classification,
                    error = %error,
                    "Attempt failed, will retry"
                )
            }
            Event::RetryScheduled {
                operation,
                attempt,
                delay,
            } => {
                debug!(
                    operation = %operation,
                    attempt,
                    delay_ms = delay.as_millis(),
                    "Retry scheduled"
                )
            }
            Event::Polled {
                id,
                probe,
                status,
                elapsed,
            } => {
                debug!(
                    id = %id,
                    probe,
                    status = status.as_deref().unwrap_or("<absent>"),
                    elapsed_ms = elapsed.as_millis(),
                    "Polled resource"
                )
            }
            Event::PageFetched {
                page,
                raw,
                kept,
                last,
            } => {
                debug!(page, raw, kept, last, "Fetched page")
            }
            Event::TagsRemoved { keys } => info!(keys = ?keys, "Removed tags"),
            Event::TagsCreated { keys } => info!(keys = ?keys, "Created tags"),
        }
    }
}

pub(crate) fn default_observer() -> Arc<dyn Observer> {
    Arc::new(TracingObserver)
}

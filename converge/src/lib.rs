//! converge: drives remote cloud operations to an observed, consistent end state.
//!
//! Cloud control planes are eventually consistent, rate limited and
//! asynchronous. Every resource handler needs the same machinery around its
//! API calls; this crate provides it once:
//! - [`retry::Retrier`] re-invokes a call under a linear backoff until it
//!   succeeds, fails fatally or runs out of time budget
//! - [`poll::Poller`] probes a resource until it reaches a target status
//! - [`paginate::Paginator`] walks index- or token-paged list endpoints
//! - [`tags::TagReconciler`] converges a remote tag set to a declared one
//! - [`operation::Converger`] composes the above into create/update/delete/list
//!
//! # Example
//! ```ignore
//! use converge::{BackoffPolicy, CodeClassifier, Retrier};
//! use std::time::Duration;
//!
//! let retrier = Retrier::new("DescribeInstance", Duration::from_secs(300), BackoffPolicy::read());
//! let instance = retrier
//!     .execute(&CodeClassifier::default(), || client.describe_instance(&id))
//!     .await?;
//! ```

pub mod backoff;
pub mod classify;
pub mod config;
pub mod error;
pub mod observe;
pub mod operation;
pub mod paginate;
pub mod poll;
pub mod retry;
pub mod tags;
pub mod token;
mod wait;

pub use backoff::BackoffPolicy;
pub use classify::{Classification, CodeClassifier, CodedError, ErrorClassifier, RetryOutcome};
pub use config::ConvergeConfig;
pub use error::{ConfigError, Error};
pub use observe::{Event, Observer, TracingObserver};
pub use operation::{CloudResource, Converger};
pub use paginate::{Page, PageCursor, Paginator};
pub use poll::{Converged, Observation, PollSpec, Poller, RawStatus, ResourceStatus, StateProbe};
pub use retry::{Attempt, Retrier};
pub use tags::{ReservedPrefixes, TagDiff, TagReconciler, TagSet};
pub use token::{ClientTokenGenerator, IdempotencyToken, TokenGenerator};

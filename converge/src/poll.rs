//! State convergence poller.
//!
//! After a mutating call returns, the resource is usually still in flight
//! (`Creating`, `Stopping`, ...). [`Poller::wait_for`] probes it until it
//! reaches a target status, hits a failure status, or the timeout elapses.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConfigError, Error};
use crate::observe::{Event, Observer, default_observer};
use crate::wait::pause;

/// Anything usable as a resource status.
pub trait ResourceStatus: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

impl<T> ResourceStatus for T where T: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

/// Provider status string for resource families without a closed enum.
///
/// Must be non-empty and free of whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawStatus(String);

impl RawStatus {
    pub fn new(status: impl Into<String>) -> Result<Self, ConfigError> {
        let status = status.into();
        if status.is_empty() || status.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidStatus(status));
        }
        Ok(Self(status))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RawStatus {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for RawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<S> {
    Status(S),
    NotFound,
}

/// Terminal state a wait ended in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Converged<S> {
    Status(S),
    /// The resource is gone and absence was a target.
    Absent,
}

impl<S> Converged<S> {
    pub fn status(&self) -> Option<&S> {
        match self {
            Converged::Status(s) => Some(s),
            Converged::Absent => None,
        }
    }
}

/// What to wait for, and for how long.
#[derive(Debug, Clone)]
pub struct PollSpec<S> {
    target: HashSet<S>,
    failure: HashSet<S>,
    pending: HashSet<S>,
    accept_absent: bool,
    interval: Duration,
    timeout: Duration,
    delay: Duration,
    continuous_target: u32,
    not_found_checks: u32,
}

impl<S: ResourceStatus> PollSpec<S> {
    /// Consecutive "not found" probes tolerated while absence is not a target.
    pub const DEFAULT_NOT_FOUND_CHECKS: u32 = 20;

    /// Target and failure sets must be disjoint and the target set non-empty.
    pub fn new(
        target: impl IntoIterator<Item = S>,
        failure: impl IntoIterator<Item = S>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let target: HashSet<S> = target.into_iter().collect();
        let failure: HashSet<S> = failure.into_iter().collect();
        if target.is_empty() {
            return Err(ConfigError::NoTarget);
        }
        if let Some(overlap) = target.intersection(&failure).next() {
            return Err(ConfigError::OverlappingStatus(overlap.to_string()));
        }
        Self::build(target, failure, false, interval, timeout)
    }

    /// Wait until the resource is gone.
    pub fn absent(interval: Duration, timeout: Duration) -> Result<Self, ConfigError> {
        Self::build(HashSet::new(), HashSet::new(), true, interval, timeout)
    }

    fn build(
        target: HashSet<S>,
        failure: HashSet<S>,
        accept_absent: bool,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(Self {
            target,
            failure,
            pending: HashSet::new(),
            accept_absent,
            interval,
            timeout,
            delay: Duration::ZERO,
            continuous_target: 1,
            not_found_checks: Self::DEFAULT_NOT_FOUND_CHECKS,
        })
    }

    /// Also treat "not found" as a target.
    pub fn accept_absent(mut self) -> Self {
        self.accept_absent = true;
        self
    }

    /// Statuses expected on the way to a target. Once set, any status that is
    /// neither pending, target nor failure aborts the wait.
    pub fn with_pending(mut self, pending: impl IntoIterator<Item = S>) -> Self {
        self.pending = pending.into_iter().collect();
        self
    }

    /// Wait before the first probe.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Require the target to be observed `count` times in a row.
    pub fn with_continuous_target(mut self, count: u32) -> Self {
        self.continuous_target = count.max(1);
        self
    }

    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_target(&self, status: &S) -> bool {
        self.target.contains(status)
    }

    pub fn is_failure(&self, status: &S) -> bool {
        self.failure.contains(status)
    }
}

/// Observes the current status of a resource.
///
/// Closures `Fn(&str) -> impl Future<Output = Result<Observation<S>, Error<E>>>`
/// implement this trait, as long as the future they return is `'static`.
#[async_trait]
pub trait StateProbe<S, E>: Send + Sync {
    async fn probe(&self, id: &str) -> Result<Observation<S>, Error<E>>;
}

#[async_trait]
impl<S, E, F, Fut> StateProbe<S, E> for F
where
    S: Send + 'static,
    E: Send + 'static,
    F: Fn(&str) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Observation<S>, Error<E>>> + Send + 'static,
{
    async fn probe(&self, id: &str) -> Result<Observation<S>, Error<E>> {
        self(id).await
    }
}

/// Runs poll loops. Holds no per-wait state.
#[derive(Clone)]
pub struct Poller {
    observer: Arc<dyn Observer>,
    cancel: Option<CancellationToken>,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            observer: default_observer(),
            cancel: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Probe `id` until it converges.
    ///
    /// The resource is probed at least once; the last probe happens at the
    /// deadline because the final sleep is clamped to the time remaining.
    /// Probe errors are returned unchanged.
    pub async fn wait_for<S, E, P>(
        &self,
        id: &str,
        spec: &PollSpec<S>,
        probe: &P,
    ) -> Result<Converged<S>, Error<E>>
    where
        S: ResourceStatus,
        P: StateProbe<S, E> + ?Sized,
    {
        let start = Instant::now();
        // An unrepresentable deadline means no deadline.
        let deadline = start.checked_add(spec.timeout);

        if !spec.delay.is_zero()
            && !pause(spec.delay.min(spec.timeout), self.cancel.as_ref()).await
        {
            return Err(self.cancelled(id));
        }

        let mut probes: u32 = 0;
        let mut last_status: Option<String> = None;
        let mut target_streak: u32 = 0;
        let mut not_found_streak: u32 = 0;

        loop {
            probes += 1;
            // A probe that retries internally must not outlive the deadline.
            let observation = match deadline {
                Some(deadline) => match timeout_at(deadline, probe.probe(id)).await {
                    Ok(observation) => observation?,
                    Err(_) => return Err(self.timed_out(id, spec.timeout, probes, last_status)),
                },
                None => probe.probe(id).await?,
            };

            match observation {
                Observation::NotFound => {
                    self.polled(id, probes, None, start);
                    target_streak = 0;
                    if spec.accept_absent {
                        debug!(id = %id, probes, "Resource is gone");
                        return Ok(Converged::Absent);
                    }
                    not_found_streak += 1;
                    if not_found_streak > spec.not_found_checks {
                        warn!(
                            id = %id,
                            checks = not_found_streak,
                            "Resource not found while waiting"
                        );
                        return Err(Error::Vanished {
                            id: id.to_string(),
                            checks: not_found_streak,
                        });
                    }
                }
                Observation::Status(status) => {
                    let text = status.to_string();
                    self.polled(id, probes, Some(text.clone()), start);
                    not_found_streak = 0;

                    if spec.failure.contains(&status) {
                        warn!(id = %id, status = %text, "Resource reached failure state");
                        return Err(Error::FailureState { id: id.to_string(), status: text });
                    }
                    if spec.target.contains(&status) {
                        target_streak += 1;
                        if target_streak >= spec.continuous_target {
                            debug!(
                                id = %id,
                                status = %text,
                                probes,
                                elapsed_ms = start.elapsed().as_millis(),
                                "Resource converged"
                            );
                            return Ok(Converged::Status(status));
                        }
                    } else {
                        target_streak = 0;
                        if !spec.pending.is_empty() && !spec.pending.contains(&status) {
                            return Err(Error::UnexpectedState { id: id.to_string(), status: text });
                        }
                    }
                    last_status = Some(text);
                }
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                return Err(self.timed_out(id, spec.timeout, probes, last_status));
            }
            if !pause(spec.interval.min(remaining), self.cancel.as_ref()).await {
                return Err(self.cancelled(id));
            }
        }
    }

    fn polled(&self, id: &str, probe: u32, status: Option<String>, start: Instant) {
        self.observer.observe(&Event::Polled {
            id: id.to_string(),
            probe,
            status,
            elapsed: start.elapsed(),
        });
    }

    fn timed_out<E>(
        &self,
        id: &str,
        timeout: Duration,
        probes: u32,
        last_status: Option<String>,
    ) -> Error<E> {
        warn!(
            id = %id,
            probes,
            timeout_ms = timeout.as_millis(),
            "Timed out waiting for resource"
        );
        Error::ConvergeTimeout {
            id: id.to_string(),
            timeout,
            last_status,
        }
    }

    fn cancelled<E>(&self, id: &str) -> Error<E> {
        debug!(id = %id, "Wait cancelled");
        Error::Cancelled {
            operation: format!("wait for {id}"),
            last: None,
        }
    }
}

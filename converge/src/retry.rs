//! Retry executor: re-invokes one remote call until it succeeds, fails
//! fatally, or the time budget runs out.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::classify::{Classification, ErrorClassifier, RetryOutcome};
use crate::error::Error;
use crate::observe::{Event, Observer, default_observer};
use crate::token::{IdempotencyToken, TokenGenerator};
use crate::wait::pause;

/// One invocation of the remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 0 for the first call, 1 for the first retry, ...
    pub index: u32,
    /// Time since the operation started.
    pub elapsed: Duration,
}

/// Runs a remote call under a time budget and a backoff policy.
///
/// The retrier holds no per-call state; clone it freely and reuse it for any
/// number of operations.
#[derive(Clone)]
pub struct Retrier {
    operation: String,
    budget: Duration,
    backoff: BackoffPolicy,
    observer: Arc<dyn Observer>,
    cancel: Option<CancellationToken>,
}

impl fmt::Debug for Retrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrier")
            .field("operation", &self.operation)
            .field("budget", &self.budget)
            .field("backoff", &self.backoff)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl Retrier {
    pub fn new(operation: impl Into<String>, budget: Duration, backoff: BackoffPolicy) -> Self {
        Self {
            operation: operation.into(),
            budget,
            backoff,
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

    /// Same budget, backoff, observer and cancellation for a different operation.
    pub fn for_operation(&self, operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..self.clone()
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Invoke `call` until it succeeds or fails fatally.
    ///
    /// Every retry is preceded by `backoff.next(attempt)`. Once a retryable
    /// failure is seen after the budget has elapsed, the last error is
    /// returned wrapped in [`Error::RetryTimeout`].
    pub async fn execute<T, E, C, F, Fut>(&self, classifier: &C, mut call: F) -> Result<T, Error<E>>
    where
        C: ErrorClassifier<E> + ?Sized,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_attempts(classifier, |_| call()).await
    }

    /// Like [`Retrier::execute`], but `call` learns which attempt it is.
    pub async fn execute_attempts<T, E, C, F, Fut>(
        &self,
        classifier: &C,
        mut call: F,
    ) -> Result<T, Error<E>>
    where
        C: ErrorClassifier<E> + ?Sized,
        E: fmt::Display,
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let mut index: u32 = 0;

        loop {
            let attempt = Attempt {
                index,
                elapsed: start.elapsed(),
            };

            let error = match RetryOutcome::classify(call(attempt).await, classifier) {
                RetryOutcome::Success(value) => {
                    if index > 0 {
                        debug!(
                            operation = %self.operation,
                            attempts = index + 1,
                            "Succeeded after retrying"
                        );
                    }
                    return Ok(value);
                }
                RetryOutcome::FatalFailure(error) => {
                    self.failed(index, start.elapsed(), Classification::Fatal, &error);
                    return Err(Error::Fatal(error));
                }
                RetryOutcome::RetryableFailure {
                    error,
                    classification,
                } => {
                    self.failed(index, start.elapsed(), classification, &error);
                    error
                }
            };

            let elapsed = start.elapsed();
            if elapsed >= self.budget {
                warn!(
                    operation = %self.operation,
                    attempts = index + 1,
                    elapsed_ms = elapsed.as_millis(),
                    "Retry budget exhausted"
                );
                return Err(Error::RetryTimeout {
                    attempts: index + 1,
                    elapsed,
                    last: error,
                });
            }

            let delay = self.backoff.next(index);
            self.observer.observe(&Event::RetryScheduled {
                operation: self.operation.clone(),
                attempt: index,
                delay,
            });
            if !pause(delay, self.cancel.as_ref()).await {
                debug!(operation = %self.operation, "Retry cancelled");
                return Err(Error::Cancelled {
                    operation: self.operation.clone(),
                    last: Some(error),
                });
            }
            index = index.saturating_add(1);
        }
    }

    /// Execute a mutating call under one idempotency token.
    ///
    /// The token is generated once and handed unchanged to every attempt, so
    /// the provider can recognise a retried create after an ambiguous failure
    /// as the same logical request.
    pub async fn execute_idempotent<T, E, C, G, F, Fut>(
        &self,
        classifier: &C,
        tokens: &G,
        mut call: F,
    ) -> Result<T, Error<E>>
    where
        C: ErrorClassifier<E> + ?Sized,
        G: TokenGenerator + ?Sized,
        E: fmt::Display,
        F: FnMut(IdempotencyToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let token = tokens.generate(&self.operation);
        debug!(operation = %self.operation, token = %token, "Issued idempotency token");
        self.execute(classifier, || call(token.clone())).await
    }

    /// Execute a call for which "not found" counts as done, such as a delete.
    ///
    /// Returns `Ok(None)` when the classifier flags the fatal error as not found.
    pub async fn execute_ignoring_not_found<T, E, C, F, Fut>(
        &self,
        classifier: &C,
        call: F,
    ) -> Result<Option<T>, Error<E>>
    where
        C: ErrorClassifier<E> + ?Sized,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.execute(classifier, call).await {
            Ok(value) => Ok(Some(value)),
            Err(Error::Fatal(error)) if classifier.is_not_found(&error) => {
                debug!(operation = %self.operation, error = %error, "Resource already gone");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn failed<E: fmt::Display>(
        &self,
        attempt: u32,
        elapsed: Duration,
        classification: Classification,
        error: &E,
    ) {
        self.observer.observe(&Event::AttemptFailed {
            operation: self.operation.clone(),
            attempt,
            elapsed,
            classification,
            error: error.to_string(),
        });
    }
}

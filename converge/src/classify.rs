//! Error classification: deciding whether a failed call is worth retrying.

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Will not succeed by retrying (bad request, permission denied, ...).
    Fatal,
    /// Transient failure; retry after backoff.
    Retryable,
    /// The provider throttled the call; retry after backoff.
    RateLimited,
}

impl Classification {
    pub fn is_retryable(self) -> bool {
        !matches!(self, Classification::Fatal)
    }
}

/// Result of one attempt after classification.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success(T),
    RetryableFailure {
        error: E,
        classification: Classification,
    },
    FatalFailure(E),
}

impl<T, E> RetryOutcome<T, E> {
    /// Classify the result of a single attempt.
    pub fn classify<C>(result: Result<T, E>, classifier: &C) -> Self
    where
        C: ErrorClassifier<E> + ?Sized,
    {
        match result {
            Ok(value) => RetryOutcome::Success(value),
            Err(error) => match classifier.classify(&error) {
                Classification::Fatal => RetryOutcome::FatalFailure(error),
                classification => RetryOutcome::RetryableFailure {
                    error,
                    classification,
                },
            },
        }
    }
}

/// Caller-supplied judgement of remote errors.
///
/// Closures `Fn(&E) -> Classification` implement this trait directly; they
/// never report "not found".
pub trait ErrorClassifier<E>: Send + Sync {
    fn classify(&self, error: &E) -> Classification;

    /// Whether the error means the addressed resource does not exist.
    fn is_not_found(&self, _error: &E) -> bool {
        false
    }
}

impl<E, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> Classification + Send + Sync,
{
    fn classify(&self, error: &E) -> Classification {
        self(error)
    }
}

/// Provider error carrying a machine-readable error code.
pub trait CodedError {
    /// Provider error code such as `Throttling` or `InvalidInstanceId.NotFound`.
    fn code(&self) -> Option<&str>;

    /// Whether the error happened below the API (connection reset, timeout).
    /// The request may or may not have reached the provider.
    fn is_transport(&self) -> bool {
        false
    }
}

/// Codes the provider uses when throttling a caller.
pub const THROTTLING_CODES: &[&str] = &["Throttling", "Throttling.User", "Throttling.Api"];

/// Codes for transient provider-side conditions.
pub const RETRYABLE_CODES: &[&str] = &[
    "SystemBusy",
    "ServiceUnavailable",
    "InternalError",
    "IdempotenceProcessing",
    "LastTokenProcessing",
    "OperationConflict",
    "IncorrectInstanceStatus",
];

/// Codes meaning the resource does not exist, in addition to any `*.NotFound` code.
pub const NOT_FOUND_CODES: &[&str] = &["NotFound", "ResourceNotFound", "EntityNotExist"];

/// Classifier driven by provider error code whitelists.
///
/// Transport errors are retryable, codes in the throttling list are rate
/// limited, codes in the retryable list are retryable, everything else is
/// fatal. Per call site lists extend the defaults.
#[derive(Debug, Clone)]
pub struct CodeClassifier {
    throttling: Vec<String>,
    retryable: Vec<String>,
    not_found: Vec<String>,
}

impl CodeClassifier {
    /// Classifier with no codes at all; only transport errors are retried.
    pub fn empty() -> Self {
        Self {
            throttling: Vec::new(),
            retryable: Vec::new(),
            not_found: Vec::new(),
        }
    }

    pub fn retry_on<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable.extend(codes.into_iter().map(Into::into));
        self
    }

    pub fn throttle_on<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.throttling.extend(codes.into_iter().map(Into::into));
        self
    }

    pub fn not_found_on<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.not_found.extend(codes.into_iter().map(Into::into));
        self
    }

    /// Classify a bare error code.
    pub fn classify_code(&self, code: &str) -> Classification {
        if self.throttling.iter().any(|c| c == code) {
            Classification::RateLimited
        } else if self.retryable.iter().any(|c| c == code) {
            Classification::Retryable
        } else {
            Classification::Fatal
        }
    }

    pub fn is_not_found_code(&self, code: &str) -> bool {
        code.ends_with(".NotFound") || self.not_found.iter().any(|c| c == code)
    }
}

impl Default for CodeClassifier {
    fn default() -> Self {
        Self::empty()
            .throttle_on(THROTTLING_CODES.iter().copied())
            .retry_on(RETRYABLE_CODES.iter().copied())
            .not_found_on(NOT_FOUND_CODES.iter().copied())
    }
}

impl<E> ErrorClassifier<E> for CodeClassifier
where
    E: CodedError,
{
    fn classify(&self, error: &E) -> Classification {
        if error.is_transport() {
            return Classification::Retryable;
        }
        match error.code() {
            Some(code) => self.classify_code(code),
            None => Classification::Fatal,
        }
    }

    fn is_not_found(&self, error: &E) -> bool {
        error.code().is_some_and(|code| self.is_not_found_code(code))
    }
}

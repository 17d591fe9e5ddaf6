//! Idempotency tokens for mutating requests.

use std::fmt;

use uuid::Uuid;

/// Providers reject client tokens longer than this many bytes.
pub const MAX_TOKEN_LEN: usize = 64;

/// Value attached to a mutating request so the provider deduplicates retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of idempotency tokens, one per logical operation.
pub trait TokenGenerator: Send + Sync {
    fn generate(&self, action: &str) -> IdempotencyToken;
}

impl<F> TokenGenerator for F
where
    F: Fn(&str) -> IdempotencyToken + Send + Sync,
{
    fn generate(&self, action: &str) -> IdempotencyToken {
        self(action)
    }
}

/// Generates `<prefix>-<action>-<unix secs>-<16 hex digits>` tokens.
#[derive(Debug, Clone)]
pub struct ClientTokenGenerator {
    prefix: String,
}

impl ClientTokenGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for ClientTokenGenerator {
    fn default() -> Self {
        Self::new("converge")
    }
}

impl TokenGenerator for ClientTokenGenerator {
    fn generate(&self, action: &str) -> IdempotencyToken {
        // The unique tail is kept whole; a long prefix or action is cut instead.
        let nonce = Uuid::new_v4().simple().to_string();
        let tail = format!("-{}-{}", chrono::Utc::now().timestamp(), &nonce[..16]);
        let mut head = format!("{}-{}", self.prefix, action);
        truncate_bytes(&mut head, MAX_TOKEN_LEN.saturating_sub(tail.len()));
        IdempotencyToken(head + &tail)
    }
}

/// Cut `s` to at most `max` bytes without splitting a character.
fn truncate_bytes(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

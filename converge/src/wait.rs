use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Sleep for `delay`, waking early if `cancel` fires.
///
/// Returns `false` when the wait was cancelled.
pub(crate) async fn pause(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}

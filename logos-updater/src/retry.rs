//! Bounded-wait retries for downstream calls.
//!
//! Each attempt races the call against `attempt_timeout`; a slow call is
//! dropped and retried rather than awaited indefinitely. A write conflict is
//! retried exactly once after a short random delay.
//!
//! ```text
//!   attempt 0 ──timeout──► backoff ──► attempt 1 ──ok──► done
//!                                          │
//!                                       conflict ──jitter──► retry once ──conflict──► Err
//! ```

use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::collaborators::CollaboratorError;
use crate::config::RetryPolicy;
use crate::error::UpdaterError;

/// Outcome of an exhausted retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Every attempt exceeded the bounded wait
    Timeout(Duration),
    /// Last failure reported by the collaborator
    Failed(CollaboratorError),
}

impl RetryError {
    /// Attach document context.
    pub fn into_updater(self, operation: &'static str, project_id: Uuid, doc_id: Uuid) -> UpdaterError {
        match self {
            RetryError::Timeout(timeout) => UpdaterError::DownstreamTimeout { operation, timeout },
            RetryError::Failed(err) => UpdaterError::from_collaborator(err, operation, project_id, doc_id),
        }
    }
}

/// Run `call` under `policy`.
///
/// `NotFound` and `Integrity` failures are returned immediately; they will
/// not change on retry.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, operation: &'static str, mut call: F) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let mut conflict_retried = false;
    let mut attempt = 0u32;

    loop {
        let last = match tokio::time::timeout(policy.attempt_timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(CollaboratorError::Conflict)) => {
                if conflict_retried {
                    return Err(RetryError::Failed(CollaboratorError::Conflict));
                }
                conflict_retried = true;
                let delay = jitter(policy.conflict_backoff_max);
                log::debug!("{operation} hit a write conflict, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                continue;
            }
            Ok(Err(err @ (CollaboratorError::NotFound | CollaboratorError::Integrity(_)))) => {
                return Err(RetryError::Failed(err));
            }
            Ok(Err(err)) => {
                log::warn!("{operation} attempt {} failed: {err}", attempt + 1);
                RetryError::Failed(err)
            }
            Err(_) => {
                log::warn!(
                    "{operation} attempt {} timed out after {:?}",
                    attempt + 1,
                    policy.attempt_timeout
                );
                RetryError::Timeout(policy.attempt_timeout)
            }
        };

        if attempt >= policy.max_retries {
            return Err(last);
        }
        tokio::time::sleep(policy.backoff(attempt)).await;
        attempt += 1;
    }
}

/// Random delay in `[0, max]`.
fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::random_range(0..=max_ms))
}

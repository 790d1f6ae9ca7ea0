use std::{future::Future, time::Duration};

use tokio::{sync::watch, time::sleep};

/// Bound on a visibility-race retry loop: how many times to look and how long
/// to back off between looks.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Found(T),
    Exhausted,
    Cancelled,
}

/// Polls `attempt` until it yields a value, the attempt budget runs out, or
/// the shutdown channel fires. Backoff sleeps never block a worker thread and
/// are abandoned mid-wait on shutdown.
///
/// Errors from `attempt` propagate immediately: a failing store is not a
/// visibility race and retrying it would only mask the fault.
pub async fn retry_until_some<T, E, F, Fut>(
    policy: RetryPolicy,
    shutdown: &mut watch::Receiver<()>,
    mut attempt: F,
) -> Result<RetryOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for tries in 0..policy.max_attempts {
        if let Some(value) = attempt().await? {
            return Ok(RetryOutcome::Found(value));
        }
        // No sleep after the final attempt.
        if tries + 1 == policy.max_attempts {
            break;
        }
        tokio::select! {
            _ = sleep(policy.backoff) => {}
            _ = shutdown.changed() => {
                return Ok(RetryOutcome::Cancelled);
            }
        }
    }
    Ok(RetryOutcome::Exhausted)
}

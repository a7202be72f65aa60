//! Bounded polling for provider-side state transitions.

use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::debug;

use super::{Provider, ProviderError, Resource, ResourceKind};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_DEADLINE: Duration = Duration::from_secs(600);
const FAILURE_STATUS: &str = "ERROR";

/// Fixed-interval retry bounded by a total deadline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    interval: Duration,
    deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, DEFAULT_DEADLINE)
    }
}

impl RetryPolicy {
    /// Creates a policy polling every `interval` for at most `deadline`.
    #[must_use]
    pub const fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }

    /// Delay between polls.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Total time allowed for the wait.
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Polls `kind`/`id` until its status equals `wanted`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Failed`] when the resource reports `ERROR`,
    /// [`ProviderError::Timeout`] once the deadline passes, and any error
    /// raised by [`Provider::get`].
    pub async fn wait_for_status(
        &self,
        provider: &dyn Provider,
        kind: ResourceKind,
        id: &str,
        wanted: &str,
    ) -> Result<Resource, ProviderError> {
        let started = Instant::now();
        // A deadline past the end of the clock never expires.
        let deadline = started.checked_add(self.deadline);

        while deadline.is_none_or(|limit| Instant::now() <= limit) {
            let resource = provider.get(kind, id).await?;
            match resource.status.as_deref() {
                Some(status) if status.eq_ignore_ascii_case(wanted) => return Ok(resource),
                Some(status) if status.eq_ignore_ascii_case(FAILURE_STATUS) => {
                    return Err(ProviderError::Failed {
                        kind,
                        id: id.to_owned(),
                        status: status.to_owned(),
                    });
                }
                status => {
                    debug!(%kind, id, status = status.unwrap_or("unknown"), wanted, "waiting");
                }
            }
            sleep(self.interval).await;
        }

        Err(ProviderError::Timeout {
            kind,
            id: id.to_owned(),
            wanted: wanted.to_owned(),
            waited: started.elapsed(),
        })
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ledger::LedgerResult;

/// Bounded exponential backoff for ledger reads.
///
/// Attempt `n` (0-based) waits `min(base * 2^n, cap)` before retrying.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Runs `op`, retrying failures up to `max_retries` times.
    pub async fn retry<T, F, Fut>(&self, label: &str, mut op: F) -> LedgerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let mut retry_count = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retry_count < self.max_retries => {
                    let delay = self.delay_for(retry_count);
                    warn!(
                        "Read {} failed (attempt {}), retrying in {:?}: {}",
                        label,
                        retry_count + 1,
                        delay,
                        e
                    );
                    retry_count += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Offsets, measured from confirmation, at which state is re-read after a
/// successful write. Confirmed state can take seconds to reach every RPC node.
#[derive(Debug, Clone)]
pub struct RefetchSchedule {
    pub delays: Vec<Duration>,
}

impl Default for RefetchSchedule {
    fn default() -> Self {
        Self::from_millis(&[0, 500, 1_000, 2_000, 3_000, 5_000, 10_000])
    }
}

impl RefetchSchedule {
    pub fn from_millis(delays: &[u64]) -> Self {
        Self {
            delays: delays.iter().copied().map(Duration::from_millis).collect(),
        }
    }

    /// Spawns one independent task per delay. Task failures are logged by
    /// `refetch` itself and never reach the caller.
    pub fn spawn<F, Fut>(&self, refetch: F) -> CascadeHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let refetch = Arc::new(refetch);
        let tasks = self
            .delays
            .iter()
            .copied()
            .map(|delay| {
                let refetch = refetch.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    debug!("Running scheduled refetch at +{:?}", delay);
                    refetch().await;
                })
            })
            .collect();
        CascadeHandle { tasks }
    }
}

/// Handles of a running refetch cascade.
pub struct CascadeHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl CascadeHandle {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every scheduled refetch to finish.
    pub async fn join(self) {
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!("Refetch task ended abnormally: {}", e);
            }
        }
    }

    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

use regulator_common::MAX_CYCLE_DELAY;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCycle {
    pub delay: Duration,
    pub deadline: Instant,
}

/// Single-shot timer owning the only pending cycle.
#[derive(Debug, Default)]
pub struct CycleScheduler {
    pending: Option<PendingCycle>,
    delay: Duration,
}

impl CycleScheduler {
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            pending: None,
            delay: initial_delay,
        }
    }

    pub fn reschedule(&mut self, delay: Duration) -> PendingCycle {
        if let Some(previous) = self.pending.take() {
            debug!(delay = ?previous.delay, "cancelled pending cycle");
        }

        let delay = delay.min(MAX_CYCLE_DELAY);
        let now = Instant::now();
        let pending = PendingCycle {
            delay,
            deadline: now.checked_add(delay).unwrap_or(now),
        };
        self.pending = Some(pending);
        self.delay = delay;
        debug!("next request scheduled in {delay:?}");
        pending
    }

    pub fn cancel(&mut self) -> Option<PendingCycle> {
        self.pending.take()
    }

    pub fn pending(&self) -> Option<PendingCycle> {
        self.pending
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Dropping the future before it completes leaves the cycle pending.
    pub async fn wait(&mut self) -> Option<PendingCycle> {
        let pending = self.pending?;
        sleep_until(pending.deadline).await;
        self.pending.take()
    }
}

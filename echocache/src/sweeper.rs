use std::time::Duration;

use tokio::task::JoinHandle;

/// Shortest period a sweeper will run at.
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// A periodic background task. The task is aborted when this handle is dropped.
#[derive(Debug)]
pub struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Run `sweep` every `period`, starting one period from now.
    ///
    /// The task ends on its own when `sweep` returns `false`. A zero
    /// `period` is raised to one second.
    pub fn every<F>(period: Duration, mut sweep: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let period = if period.is_zero() {
            tracing::warn!(?MIN_PERIOD, "Sweeper period is zero, using the minimum");
            MIN_PERIOD
        } else {
            period
        };
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !(sweep)() {
                    tracing::trace!("Sweeper target dropped, stopping");
                    break;
                }
            }
        });
        Self { handle }
    }

    /// Whether the background task has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

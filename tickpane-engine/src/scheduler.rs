//! Recurring-task scheduler.
//!
//! The engine's polling cadences (alert sampling, backfill detection) are
//! named recurring tasks owned by this scheduler instead of ad-hoc timers,
//! so they can be cancelled individually and driven under paused time in
//! tests. Each task sends a fixed command into the engine's command
//! channel on every interval tick; the engine itself stays single-threaded.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Owns named recurring tasks; dropping the scheduler cancels them all
#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: HashMap<String, JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a named recurring task that sends `command` every `period`.
    ///
    /// Scheduling a name that already exists replaces (cancels) the
    /// previous task. The task ends on its own when the receiver closes.
    pub fn schedule<T>(
        &mut self,
        name: impl Into<String>,
        period: Duration,
        tx: mpsc::UnboundedSender<T>,
        command: T,
    ) where
        T: Clone + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, ?period, "recurring task scheduled");

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so the task
            // fires one full period after being scheduled
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(command.clone()).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.tasks.insert(name, task) {
            previous.abort();
        }
    }

    /// Cancel a named task; returns false if no such task exists
    pub fn cancel(&mut self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some(task) => {
                task.abort();
                debug!(task = name, "recurring task cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_task_fires_on_period() {
        let mut scheduler = Scheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.schedule("alert-sampling", Duration::from_secs(1), tx, ());
        // Let the task start its interval before advancing the clock
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(rx.try_recv(), Ok(()));
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(3)).await;
        let mut ticks = 0;
        while rx.try_recv().is_ok() {
            ticks += 1;
        }
        assert_eq!(ticks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_task() {
        let mut scheduler = Scheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.schedule("backfill-poll", Duration::from_secs(1), tx, ());
        tokio::task::yield_now().await;

        assert!(scheduler.is_scheduled("backfill-poll"));
        assert!(scheduler.cancel("backfill-poll"));
        assert!(!scheduler.cancel("backfill-poll"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_replaces_previous_task() {
        let mut scheduler = Scheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.schedule("poll", Duration::from_secs(10), tx.clone(), 1u32);
        scheduler.schedule("poll", Duration::from_secs(1), tx, 2u32);
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(1001)).await;
        tokio::task::yield_now().await;
        assert_eq!(rx.try_recv(), Ok(2));
    }
}

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use rocket::tokio::{
    self,
    sync::Notify,
    task::{JoinError, JoinHandle},
    time::Duration,
};

/// A task scheduled for a specific point in the future.
/// It will automatically execute at that point, or can be cancelled or triggered early.
pub struct ScheduledTask<T> {
    handle: JoinHandle<T>,
    trigger: Arc<Notify>,
}

impl<T> ScheduledTask<T>
where
    T: Send + 'static,
{
    /// Schedule the given task to execute at time `run_at`.
    /// If `run_at` is in the past, the task will execute immediately.
    pub fn new<Fut>(task: Fut, run_at: DateTime<Utc>) -> Self
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let trigger = Arc::new(Notify::new());
        let early = trigger.clone();
        let delay = until(run_at);
        let handle = tokio::spawn(async move {
            // Whichever comes first: the scheduled time or an explicit trigger.
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = early.notified() => {}
            }
            task.await
        });

        Self { handle, trigger }
    }

    /// Cancel the task. Returns true iff it had already completed before we could cancel it.
    pub async fn cancel(self) -> bool {
        self.handle.abort();
        self.handle.await.is_ok()
    }

    /// Trigger the task now instead of waiting till the original time.
    pub fn trigger_now(&self) {
        // Stores a permit if the task is not waiting yet.
        self.trigger.notify_one();
    }

    /// Has the task run to completion (or been aborted)?
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Implement `Future` for `ScheduledTask` so we can directly `await` it.
impl<T> Future for ScheduledTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

/// The time from now until `datetime`, or zero if it has already passed.
fn until(datetime: DateTime<Utc>) -> Duration {
    (datetime - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

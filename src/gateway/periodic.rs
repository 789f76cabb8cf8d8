//! Cooperative periodic tasks on the tokio runtime.
//!
//! A [`PeriodicTask`] runs an async callback on a fixed cadence until its
//! [`TaskHandle`] is cancelled. Cancellation only flips the running flag; the
//! loop notices it at its next wake point and never interrupts a callback
//! that is already executing.

use crate::error::{BoxError, GatewayError};
use chrono::{DateTime, NaiveTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error};

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&TaskHandle, BoxError) + Send + Sync>;

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn boxed_task<F, Fut>(f: F) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as TaskFuture)
}

/// Logs the failure and stops the task.
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|handle: &TaskHandle, err: BoxError| {
        error!(task = %handle.name(), error = %err, "Periodic task callback failed. Stopping task.");
        handle.cancel();
    })
}

pub struct PeriodicTask {
    name: String,
    interval: Duration,
    initial_delay: Duration,
    callback: TaskFn,
    before_hook: Option<TaskFn>,
    after_hook: Option<TaskFn>,
    error_handler: ErrorHandler,
}

impl PeriodicTask {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        interval: Duration,
        callback: F,
    ) -> Result<Self, GatewayError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(GatewayError::ZeroIntervalNotSupported);
        }
        Ok(Self {
            name: name.into(),
            interval,
            initial_delay: Duration::ZERO,
            callback: boxed_task(callback),
            before_hook: None,
            after_hook: None,
            error_handler: default_error_handler(),
        })
    }

    /// A task that first fires at the next `time_of_day` (UTC) and then
    /// every `every`.
    pub fn at<F, Fut>(
        name: impl Into<String>,
        time_of_day: NaiveTime,
        every: Duration,
        callback: F,
    ) -> Result<Self, GatewayError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let first_delay = delay_until(time_of_day, Utc::now());
        Ok(Self::new(name, every, callback)?.with_initial_delay(first_delay))
    }

    /// A task that fires once a day at `time_of_day` (UTC).
    pub fn daily_at<F, Fut>(
        name: impl Into<String>,
        time_of_day: NaiveTime,
        callback: F,
    ) -> Result<Self, GatewayError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::at(name, time_of_day, ONE_DAY, callback)
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Runs once before the first callback.
    pub fn before_invoke<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.before_hook = Some(boxed_task(hook));
        self
    }

    /// Runs once after the loop has stopped.
    pub fn after_invoke<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.after_hook = Some(boxed_task(hook));
        self
    }

    /// Replaces the handler invoked when the callback returns an error.
    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawns the loop. Must be called from within a tokio runtime.
    pub fn start(self) -> TaskHandle {
        let (running_tx, _) = watch::channel(true);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let handle = TaskHandle {
            name: Arc::from(self.name.as_str()),
            running: Arc::new(running_tx),
            stopped: stopped_rx,
        };
        let task_handle = handle.clone();
        tokio::spawn(async move {
            self.run_loop(&task_handle).await;
            let _ = stopped_tx.send(true);
        });
        handle
    }

    async fn run_hook(&self, hook: &Option<TaskFn>, handle: &TaskHandle, which: &str) {
        if let Some(hook) = hook {
            debug!(task = %self.name, hook = which, "Running hook.");
            if let Err(e) = hook().await {
                (self.error_handler)(handle, e);
            }
        }
    }

    async fn run_loop(&self, handle: &TaskHandle) {
        let mut running = handle.running.subscribe();
        debug!(task = %self.name, interval_ms = self.interval.as_millis() as u64, "Periodic task started.");

        self.run_hook(&self.before_hook, handle, "before").await;

        let mut next_tick = Instant::now() + self.initial_delay;
        while sleep_until_or_cancel(next_tick, &mut running).await {
            debug!(task = %self.name, "Invoking callback.");
            if let Err(e) = (self.callback)().await {
                (self.error_handler)(handle, e);
            }
            next_tick += self.interval;
        }
        debug!(task = %self.name, "Periodic task cancelled. Leaving loop.");

        self.run_hook(&self.after_hook, handle, "after").await;
        debug!(task = %self.name, "Periodic task closed.");
    }
}

/// Sleeps until `deadline`, returning early when the task gets cancelled.
/// Returns whether the task should keep running.
async fn sleep_until_or_cancel(deadline: Instant, running: &mut watch::Receiver<bool>) -> bool {
    if !*running.borrow() {
        return false;
    }
    let cancelled = tokio::select! {
        _ = tokio::time::sleep_until(deadline) => false,
        _ = async { running.wait_for(|still_running| !*still_running).await.is_ok() } => true,
    };
    !cancelled && *running.borrow()
}

/// Time from `now` until the next occurrence of `time_of_day` (UTC).
pub fn delay_until(time_of_day: NaiveTime, now: DateTime<Utc>) -> Duration {
    let today = now.date_naive().and_time(time_of_day).and_utc();
    let target = if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

/// Cloneable control over a started [`PeriodicTask`].
#[derive(Clone)]
pub struct TaskHandle {
    name: Arc<str>,
    running: Arc<watch::Sender<bool>>,
    stopped: watch::Receiver<bool>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests the loop to stop at its next wake point.
    pub fn cancel(&self) {
        self.running.send_replace(false);
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Resolves once the loop (including the after-hook) has finished.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        let _ = stopped.wait_for(|done| *done).await;
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

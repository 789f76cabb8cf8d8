use crate::error::{BoxError, GatewayError};
use crate::gateway::periodic::{ErrorHandler, PeriodicTask, TaskHandle, default_error_handler};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Delay before the first beat: a uniformly random fraction of `interval`,
/// so clients sharing a cadence do not all beat at the same instant.
pub fn first_beat_delay(interval: Duration) -> Duration {
    interval.mul_f64(rand::random::<f64>())
}

/// Owns the keep-alive task of one session.
pub struct HeartbeatScheduler {
    error_handler: ErrorHandler,
    task: Option<TaskHandle>,
}

impl HeartbeatScheduler {
    pub fn new() -> Self {
        Self {
            error_handler: default_error_handler(),
            task: None,
        }
    }

    /// Replaces the handler run when `send_fn` fails. The default logs the
    /// failure and cancels the heartbeat.
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    /// Starts beating: first after [`first_beat_delay`], then every `interval`.
    /// A task left over from an earlier `start` is cancelled first.
    pub fn start<F, Fut>(&mut self, interval: Duration, send_fn: F) -> Result<(), GatewayError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let task = PeriodicTask::new("heartbeat", interval, send_fn)?;
        self.cancel();

        let first_delay = first_beat_delay(interval);
        info!(
            interval_ms = interval.as_millis() as u64,
            first_beat_ms = first_delay.as_millis() as u64,
            "Starting heartbeat."
        );
        let handle = task
            .with_initial_delay(first_delay)
            .on_error(self.error_handler.clone())
            .start();
        self.task = Some(handle);
        Ok(())
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Cancelling heartbeat.");
            task.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(TaskHandle::is_running)
    }
}

impl Default for HeartbeatScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

use quanta::{Clock, Instant};
use thiserror::Error;

use crate::registry::MetricHandle;

/// Errors that could occur while using a [`Timer`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    /// The timer was stopped while it was not running.
    #[error("timer is not running")]
    NotRunning,
}

/// Measures execution time into the extended aggregate of a metric.
///
/// A timer is created already running. Each call to [`stop`](Timer::stop) records the time elapsed since the last call
/// to [`start`](Timer::start) (or since creation) as a single observation, so one timer can be reused to measure many
/// iterations of the same piece of work.
pub struct Timer {
    metric: MetricHandle,
    clock: Clock,
    started: Instant,
    running: bool,
}

impl Timer {
    pub(crate) fn new(metric: MetricHandle, clock: Clock) -> Self {
        let started = clock.now();
        Self { metric, clock, started, running: true }
    }

    /// Starts the timer, or restarts it if it is already running.
    pub fn start(&mut self) {
        self.started = self.clock.now();
        self.running = true;
    }

    /// Stops the timer and records the elapsed time, in seconds, as an observation.
    ///
    /// Returns the elapsed time.
    ///
    /// # Errors
    ///
    /// If the timer is not running, [`TimerError::NotRunning`] is returned and nothing is recorded.
    pub fn stop(&mut self) -> Result<Duration, TimerError> {
        if !self.running {
            return Err(TimerError::NotRunning);
        }

        let elapsed = self.clock.now().duration_since(self.started);
        self.metric.add_ex(elapsed.as_secs_f64());
        self.running = false;

        Ok(elapsed)
    }

    /// Returns `true` if the timer is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Returns the metric this timer records into.
    pub fn metric(&self) -> &MetricHandle {
        &self.metric
    }

    /// Restarts the timer and wraps it in a guard that stops it when dropped.
    pub fn scoped(mut self) -> ScopedTimer {
        self.start();
        ScopedTimer { timer: self }
    }
}

/// A [`Timer`] that is stopped when it goes out of scope.
///
/// The guard only stops the timer if it is still running, so the timer can be stopped (and restarted) manually within
/// the scope without causing a second observation or an error on drop.
pub struct ScopedTimer {
    timer: Timer,
}

impl Deref for ScopedTimer {
    type Target = Timer;

    fn deref(&self) -> &Self::Target {
        &self.timer
    }
}

impl DerefMut for ScopedTimer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.timer
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        if self.timer.is_running() {
            let _ = self.timer.stop();
        }
    }
}

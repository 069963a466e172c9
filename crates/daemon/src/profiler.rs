//! Process-wide profiler service.
//!
//! The control channel can toggle profiling around a reproduction of a
//! performance problem. The service owns the running state; starting twice
//! or stopping twice is a caller error so the admin notices mismatched
//! toggles instead of silently truncated profiles.

use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;
use tracing::info;

/// Errors from toggling the profiler.
#[derive(Debug, Error)]
pub enum ProfilerError {
    /// `start` while running.
    #[error("profile is already running")]
    AlreadyRunning,
    /// `stop` while stopped.
    #[error("profile is not running")]
    NotRunning,
}

/// Explicitly constructed profiler state, injected via [`crate::App`].
#[derive(Debug, Default)]
pub struct Profiler {
    started: Mutex<Option<Instant>>,
}

impl Profiler {
    /// Creates a stopped profiler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a profiling run.
    pub fn start(&self) -> Result<(), ProfilerError> {
        let mut started = self.lock();
        if started.is_some() {
            return Err(ProfilerError::AlreadyRunning);
        }
        info!("starting profiling");
        *started = Some(Instant::now());
        Ok(())
    }

    /// Stops the current run, logging its duration.
    pub fn stop(&self) -> Result<(), ProfilerError> {
        let mut started = self.lock();
        let Some(start_time) = started.take() else {
            return Err(ProfilerError::NotRunning);
        };
        info!(
            seconds = start_time.elapsed().as_secs_f64(),
            "stopping profiling"
        );
        Ok(())
    }

    /// Whether a run is in progress.
    #[must_use]
    pub fn running(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.started
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{Profiler, ProfilerError};

    #[test]
    fn start_stop_cycle() {
        let profiler = Profiler::new();
        assert!(!profiler.running());
        profiler.start().unwrap();
        assert!(profiler.running());
        profiler.stop().unwrap();
        assert!(!profiler.running());
    }

    #[test]
    fn double_start_is_rejected() {
        let profiler = Profiler::new();
        profiler.start().unwrap();
        assert!(matches!(
            profiler.start(),
            Err(ProfilerError::AlreadyRunning)
        ));
    }

    #[test]
    fn stop_when_idle_is_rejected() {
        let profiler = Profiler::new();
        assert!(matches!(profiler.stop(), Err(ProfilerError::NotRunning)));
    }
}

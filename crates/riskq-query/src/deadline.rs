use std::time::{Duration, Instant};

/// Cooperative wall-clock budget of one request.
///
/// Scans poll [`Deadline::expired`] between row batches only, so a request may
/// overrun its budget by at most one batch.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    /// Starts the clock now.
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget: Some(budget),
        }
    }

    /// A deadline that never expires.
    pub fn unbounded() -> Self {
        Self {
            started: Instant::now(),
            budget: None,
        }
    }

    pub fn expired(&self) -> bool {
        self.budget
            .map(|budget| self.started.elapsed() >= budget)
            .unwrap_or(false)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative stop signal shared between a caller and one engine invocation.
///
/// Cloning shares the flag, so a caller can keep one handle and cancel from another thread.
/// Deadline and evaluation budget are checked by the placer between candidates.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
    max_evaluations: Option<usize>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_evaluation_budget(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = Some(max_evaluations);
        self
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .deadline
                .map_or(false, |deadline| Instant::now() >= deadline)
    }

    /// Whether work should stop after `evaluated` candidate evaluations.
    pub fn should_stop(&self, evaluated: usize) -> bool {
        self.is_cancelled()
            || self
                .max_evaluations
                .map_or(false, |budget| evaluated >= budget)
    }
}

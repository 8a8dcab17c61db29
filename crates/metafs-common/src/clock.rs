//! Process clock handle
//!
//! Components that take deadlines receive the clock as an injected
//! handle rather than reading process-wide time directly, so tests can
//! substitute a controlled time source.

use std::sync::Arc;
use std::time::Instant;

/// Monotonic time source
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The system monotonic clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Shared handle to the system clock
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

use std::time::Instant;

/// Source of monotonic time for timers and throughput measurements.
/// This allows driving timeouts deterministically in tests.
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Clock that follows tokio's timer, so paused test time also pauses timeouts
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

pub mod limiter;
pub mod scheduler;

// Re-export for convenience
pub use limiter::StartupLimiter;
pub use scheduler::{Scheduler, SchedulerError, StopHandle};

mod clock;
mod limiter;
mod process;
mod usage;

// Re-export the execution primitive and its accounting types
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use limiter::{
    LimiterGuard, ResourceLimiter, ResourceLimits, check_limits, reclassify_by_usage,
};
pub use process::{
    KillReason, ProcessHandle, ProcessState, ProgramSpec, RawExit, ReadOutcome, TerminalState,
    TerminationCause, Terminator, TimeLimitKind,
};
pub use usage::ResourceUsage;

pub(crate) use usage::serialize_millis;

//! Funnel evaluation core.
//!
//! Matches hits against funnel steps, runs each visit through a funnel's
//! state machine and accumulates per-step conversion counters that can be
//! merged across batches and across archived periods. Nothing in here does
//! I/O; fetching hits and persisting archives is the caller's job.

pub mod archive;
pub mod definition;
pub mod error;
pub mod evaluator;
pub mod hit;
pub mod matching;
pub mod metrics;

pub use archive::{FunnelArchive, MetricsRow};
pub use definition::{
    Condition, Field, FunnelDefinition, FunnelRecord, Operator, StepDefinition,
};
pub use error::{ArchiveError, DefinitionError};
pub use evaluator::{evaluate, FunnelState, VisitOutcome};
pub use hit::{Hit, HitRow, Visit};
pub use matching::{match_step, CompiledFunnel, StepMatcher};
pub use metrics::{FunnelMetrics, StepMetrics};

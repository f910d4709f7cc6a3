//! ---
//! fl_section: "01-core-orchestration"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Execution engine, rollback supervision, and scheduling."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Supervisory control loop around pluggable fault injection: the execution
//! engine drives each run through its state machine, a rollback monitor
//! watches live health metrics, and the scheduler turns experiment schedules
//! into timed runs.

pub mod drivers;
pub mod engine;
pub mod gateway;
pub mod impact;
pub mod monitor;
pub mod orchestrator;
pub mod scheduler;

pub use drivers::{ChaosDriver, DriverRegistry, SimulatedDriver, UndoFn};
pub use engine::{EngineError, EngineSettings, ExecutionEngine, ExecutionHandle};
pub use gateway::{MetricsGateway, SimulatedGateway};
pub use impact::{analyze, derive_blast_radius, lessons_learned, performance_degradation_pct};
pub use orchestrator::ChaosOrchestrator;
pub use scheduler::Scheduler;

/// Crate prelude collecting the most commonly used builders.
pub mod prelude {
    pub use super::drivers::{ChaosDriver, DriverRegistry, SimulatedDriver};
    pub use super::engine::{EngineSettings, ExecutionEngine};
    pub use super::gateway::{MetricsGateway, SimulatedGateway};
    pub use super::orchestrator::ChaosOrchestrator;
    pub use super::scheduler::Scheduler;
}

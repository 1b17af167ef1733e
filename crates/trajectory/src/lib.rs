//! Trajectory model and store — the append-only per-conversation log of
//! system / user / agent steps that serves both as agent context and as the
//! rollback/delete target.

pub mod atif;
pub mod step;
pub mod store;

pub use step::{
    ContentPart, Observation, ObservationResult, ResultContent, Step, StepDraft, StepMetrics,
    StepSource, ToolCall,
};
pub use store::{AgentInfo, Trajectory, TrajectoryStore, ATIF_SCHEMA};

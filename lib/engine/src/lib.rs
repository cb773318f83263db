//! Workflow execution engine for cascade.
//!
//! This crate contains the replay-safe core of the system:
//!
//! - **Definition model**: JSON workflow graphs (nodes + main connections)
//! - **Run state**: the checkpointed state exchanged between the
//!   orchestration and the step task, with append-only run data and a
//!   bounded diff protocol
//! - **Step task**: runs ready nodes until completion, a timer wait, or a
//!   fatal error
//! - **Orchestration**: the deterministic state machine driven by the
//!   durable worker
//! - **Expressions**: the `={{ … }}` template language resolved against
//!   accumulated run data
//! - **Wire codec**: the versioned envelope applied at the scheduler
//!   boundary

pub mod codec;
pub mod context;
pub mod definition;
pub mod error;
pub mod expression;
pub mod item;
pub mod orchestrator;
pub mod registry;
pub mod state;
pub mod step;

pub use definition::{ConnectionTarget, WorkflowDefinition, WorkflowNode};
pub use error::{EngineError, ErrorKind, NodeError, SerializedError};
pub use item::{BinaryData, ExecutionItem, PairedItem};
pub use orchestrator::{
    ExecutionStatus, ExecutionVerdict, Orchestration, OrchestrationInput, OrchestratorCommand,
    OrchestratorSignal,
};
pub use registry::{NodeType, NodeTypeDescription, NodeTypeProvider, RegistryError};
pub use state::{ExecuteFrame, RunState, TaskData, TaskDataSource};
pub use step::{StepContext, StepInput, StepOutput, run_step};

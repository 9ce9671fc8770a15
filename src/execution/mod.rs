// Order execution: the per-tick state machine and the fill coordinator.
pub mod coordinator;
pub mod engine;

pub use coordinator::{aggregate_fills, ExitFill, ExitTrigger, OrderExecutionCoordinator};
pub use engine::{EngineError, ExecutionEngine};

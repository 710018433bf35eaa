//! Lifecycle of resumable autonomous agents.
//!
//! [`orchestrator::LifecycleOrchestrator`] is the entry point: it checks
//! ownership and state, claims the agent in the [`registry::ExecutionRegistry`]
//! and hands the context to the subtype's [`executor::IterationExecutor`].
//! [`autonomous::AutonomousLoop`] is the default executor.

pub mod autonomous;
pub mod executor;
pub mod hil;
pub mod orchestrator;
pub mod registry;
pub mod state_machine;
pub mod waiter;

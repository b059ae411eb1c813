//! Gantry: a graph-based execution engine for autonomous-agent tasks.
//!
//! A task owns a DAG of typed work nodes connected by dependency edges.
//! The engine computes which nodes are ready, runs them through registered
//! handlers under timeout/retry policy, and cascades completion through the
//! graph until the task reaches a terminal state.
//!
//! This crate re-exports the workspace members; hosts typically wire a
//! [`SqliteStore`] into a [`TaskManager`] and an [`Orchestrator`] and
//! register their node handlers on a [`HandlerRegistry`].

pub use gantry_core::{
    config::{EngineConfig, ExecutorConfig, OrchestratorConfig},
    error::{GantryError, Result},
    event::{EngineEvent, EventBus},
    traits::{GraphStore, NodeHandler, NoopCodec, PayloadCodec, TaskStore},
    types::*,
};
pub use gantry_engine::{FnHandler, HandlerRegistry, NodeExecutor, Orchestrator, PlanStep, TaskManager};
pub use gantry_store::SqliteStore;

#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Goal-directed agent reasoning engine.
//!
//! Agents revise beliefs from an environment snapshot, promote goal
//! templates through staged rules and execute plans for the promoted
//! instances. Every read, write, promotion, selection and action lands in an
//! append-only execution history that the [`Explainer`] walks backwards to
//! answer why something happened, or why something else did not.

/// Logical time.
pub mod clock;
/// Instrumented data containers and rule contexts.
pub mod container;
/// Identifiers and metadata shared by every entity.
pub mod entity;
/// Error types.
pub mod error;
/// Backward causal traversals over the history.
pub mod explainer;
/// Execution history store and filters.
pub mod history;
/// Priority-ordered intention queue.
pub mod intentions;
/// Entity definitions and rule traits.
pub mod model;
/// Deliberation and intention cycles.
pub mod processor;
/// Entity registry and model builder.
pub mod registry;
/// Periodic loops on tokio.
pub mod runtime;
/// Engine configuration.
pub mod config;
/// Structured telemetry.
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{EngineConfig, RuleFailurePolicy, RuntimeMode};
pub use container::{Accessor, ActionContext, DataContainer, RevisionContext};
pub use entity::{CloneId, EntityId, EntityKind, EntityMeta};
pub use error::{EngineError, EngineResult, HistoryError, ModelError};
pub use explainer::Explainer;
pub use history::{ExecutionHistory, HistoryFilter, InMemoryExecutionHistory, Order, State};
pub use intentions::IntentionQueue;
pub use model::{GoalClone, Priority};
pub use processor::{DeliberationReport, DrainReport, SequentialProcessor};
pub use registry::{AgentSpec, CausalModel, ModelBuilder, Registry};
pub use runtime::{AgentRuntime, EnvironmentSource, FnEnvironment, RuntimeStats};
pub use telemetry::EngineTelemetry;

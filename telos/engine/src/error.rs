//! Error types surfaced by the engine layers.

use thiserror::Error;

use crate::entity::{EntityId, EntityKind};

/// Errors raised by execution-history backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// The filter set cannot be satisfied by construction.
    #[error("invalid history filter: {0}")]
    InvalidFilter(String),
    /// The backend refused to store the event.
    #[error("history rejected event {0}")]
    Rejected(String),
}

/// Errors raised while building or resolving the domain model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// No entity with this id is registered.
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
    /// The id resolves to an entity of another kind.
    #[error("entity {id} is a {actual}, expected {expected}")]
    WrongKind {
        /// Offending id.
        id: EntityId,
        /// Kind the caller asked for.
        expected: EntityKind,
        /// Kind actually registered.
        actual: EntityKind,
    },
    /// The same entity was listed twice where members must be distinct.
    #[error("entity {0} listed more than once")]
    Duplicate(EntityId),
    /// Structural problem detected while building the model.
    #[error("invalid model: {0}")]
    Invalid(String),
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Execution history failure.
    #[error(transparent)]
    History(#[from] HistoryError),
    /// Domain model failure.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// A belief-revision or promotion rule failed under the propagate policy.
    #[error("{kind} {rule} failed: {message}")]
    RuleFailed {
        /// Failing rule.
        rule: EntityId,
        /// Rule kind (belief revision or promotion).
        kind: EntityKind,
        /// Rendered error chain.
        message: String,
    },
    /// Configuration could not be used.
    #[error("configuration error: {0}")]
    Config(String),
    /// A background task could not be joined.
    #[error("runtime task failed: {0}")]
    Runtime(String),
}

/// Convenience alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

//! Append-only, time-ordered store of state-change events.
//!
//! Every component of the engine writes its decisions here and the explainer
//! reads them back. Backends keep events newest-first; [`Order::Asc`] asks a
//! query to walk the store from the oldest end instead.

/// In-memory reference backend.
pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{clock::Timestamp, entity::EntityId, error::HistoryError};

pub use memory::InMemoryExecutionHistory;

/// One recorded change of state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    /// Event identifier.
    pub id: Uuid,
    /// Entity that changed.
    pub from_id: EntityId,
    /// Entity receiving or observing the change, if any.
    pub to_id: Option<EntityId>,
    /// Completion instant.
    pub time: Timestamp,
    /// Start instant.
    pub activation_time: Timestamp,
    /// Opaque payload.
    pub value: Value,
}

impl State {
    /// Creates an event with a fresh id.
    #[must_use]
    pub fn new(
        from_id: EntityId,
        to_id: Option<EntityId>,
        activation_time: Timestamp,
        time: Timestamp,
        value: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_id,
            to_id,
            time,
            activation_time,
            value,
        }
    }

    /// Event whose start and completion coincide.
    #[must_use]
    pub fn instant(from_id: EntityId, to_id: Option<EntityId>, at: Timestamp, value: Value) -> Self {
        Self::new(from_id, to_id, at, at, value)
    }

    /// Event that did not happen, used as the subject of "why not" questions.
    #[must_use]
    pub fn hypothetical(from_id: EntityId, to_id: Option<EntityId>, at: Timestamp) -> Self {
        Self::new(from_id, to_id, at, at, Value::Object(serde_json::Map::new()))
    }

    /// Store order: the later event sorts first.
    #[must_use]
    pub fn newest_first(&self, other: &Self) -> Ordering {
        other.time.cmp(&self.time)
    }

    /// String field of an object payload.
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(Value::as_str)
    }

    /// Whether the payload carries an `error` entry.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.value.get("error").is_some()
    }
}

/// Traversal direction relative to the store's newest-first order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Oldest first.
    Asc,
    /// Newest first.
    #[default]
    Desc,
}

/// Conjunctive filter set accepted by [`ExecutionHistory::query`]. Absent
/// clauses match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HistoryFilter {
    /// Exact event id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// Accepted origins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_ids: Option<IndexSet<EntityId>>,
    /// Accepted targets; `None` inside the set matches untargeted events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_ids: Option<IndexSet<Option<EntityId>>>,
    /// Exact completion instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Timestamp>,
    /// Structurally equal payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Inclusive lower bound on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_time: Option<Timestamp>,
    /// Inclusive upper bound on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time: Option<Timestamp>,
    /// Inclusive lower bound on start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_activation_time: Option<Timestamp>,
    /// Inclusive upper bound on start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_activation_time: Option<Timestamp>,
    /// Maximum number of results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Traversal direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
}

impl HistoryFilter {
    /// Filter matching every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the JSON filter form, e.g. `{"toIds": ["…"], "limit": 1}`.
    pub fn from_json(raw: Value) -> Result<Self, HistoryError> {
        let filter: Self =
            serde_json::from_value(raw).map_err(|err| HistoryError::InvalidFilter(err.to_string()))?;
        filter.validate()?;
        Ok(filter)
    }

    /// Restricts to one event id.
    #[must_use]
    pub const fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Restricts origins to a single entity.
    #[must_use]
    pub fn from_id(self, id: EntityId) -> Self {
        self.from_ids([id])
    }

    /// Restricts origins.
    #[must_use]
    pub fn from_ids(mut self, ids: impl IntoIterator<Item = EntityId>) -> Self {
        self.from_ids = Some(ids.into_iter().collect());
        self
    }

    /// Restricts targets to a single entity.
    #[must_use]
    pub fn to_id(self, id: EntityId) -> Self {
        self.to_ids([Some(id)])
    }

    /// Restricts targets; include `None` to accept untargeted events.
    #[must_use]
    pub fn to_ids(mut self, ids: impl IntoIterator<Item = Option<EntityId>>) -> Self {
        self.to_ids = Some(ids.into_iter().collect());
        self
    }

    /// Exact completion instant.
    #[must_use]
    pub const fn time(mut self, at: Timestamp) -> Self {
        self.time = Some(at);
        self
    }

    /// Structurally equal payload.
    #[must_use]
    pub fn value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Inclusive lower bound on completion.
    #[must_use]
    pub const fn min_time(mut self, at: Timestamp) -> Self {
        self.min_time = Some(at);
        self
    }

    /// Inclusive upper bound on completion.
    #[must_use]
    pub const fn max_time(mut self, at: Timestamp) -> Self {
        self.max_time = Some(at);
        self
    }

    /// Inclusive lower bound on start.
    #[must_use]
    pub const fn min_activation_time(mut self, at: Timestamp) -> Self {
        self.min_activation_time = Some(at);
        self
    }

    /// Inclusive upper bound on start.
    #[must_use]
    pub const fn max_activation_time(mut self, at: Timestamp) -> Self {
        self.max_activation_time = Some(at);
        self
    }

    /// Maximum number of results.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Traversal direction.
    #[must_use]
    pub const fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    /// Rejects filter sets that are contradictory by construction.
    pub fn validate(&self) -> Result<(), HistoryError> {
        if let (Some(min), Some(max)) = (self.min_time, self.max_time) {
            if min > max {
                return Err(HistoryError::InvalidFilter(format!(
                    "minTime {} is after maxTime {}",
                    min.micros(),
                    max.micros()
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_activation_time, self.max_activation_time) {
            if min > max {
                return Err(HistoryError::InvalidFilter(format!(
                    "minActivationTime {} is after maxActivationTime {}",
                    min.micros(),
                    max.micros()
                )));
            }
        }
        Ok(())
    }

    /// Whether `state` satisfies every clause except `limit` and `order`.
    #[must_use]
    pub fn matches(&self, state: &State) -> bool {
        self.id.map_or(true, |id| state.id == id)
            && self
                .from_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(&state.from_id))
            && self
                .to_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(&state.to_id))
            && self.time.map_or(true, |at| state.time == at)
            && self.value.as_ref().map_or(true, |value| &state.value == value)
            && self.min_time.map_or(true, |at| state.time >= at)
            && self.max_time.map_or(true, |at| state.time <= at)
            && self
                .min_activation_time
                .map_or(true, |at| state.activation_time >= at)
            && self
                .max_activation_time
                .map_or(true, |at| state.activation_time <= at)
    }
}

/// Contract every history backend fulfils. Implementations must keep
/// newest-first ordering and make each append visible atomically.
#[async_trait]
pub trait ExecutionHistory: Send + Sync {
    /// Stores a copy of the event.
    fn append(&self, state: State) -> Result<(), HistoryError>;

    /// Returns the events matching `filter`.
    fn query(&self, filter: &HistoryFilter) -> Result<Vec<State>, HistoryError>;

    /// Number of stored events.
    fn len(&self) -> usize;

    /// Whether nothing has been recorded yet.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent match, if any.
    fn latest(&self, filter: HistoryFilter) -> Result<Option<State>, HistoryError> {
        Ok(self
            .query(&filter.limit(1).order(Order::Desc))?
            .into_iter()
            .next())
    }

    /// Asynchronous [`ExecutionHistory::append`].
    async fn append_async(&self, state: State) -> Result<(), HistoryError> {
        self.append(state)
    }

    /// Asynchronous [`ExecutionHistory::query`].
    async fn query_async(&self, filter: HistoryFilter) -> Result<Vec<State>, HistoryError> {
        self.query(&filter)
    }
}

//! Path-addressed data stores and the instrumented views rules see.
//!
//! Reads and writes made through an [`Accessor`] or a [`RevisionContext`]
//! resolve the path to an attribute, link that attribute to the rule and
//! record an event. Actions get an [`ActionContext`] whose reads leave no
//! trace.

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::{
    clock::{Clock, Timestamp},
    entity::{CloneId, EntityId},
    error::{EngineResult, HistoryError},
    history::{ExecutionHistory, State},
    model::{GoalClone, Priority},
    registry::Registry,
};

/// Nested JSON document addressed by dotted paths such as `resources.battery`.
///
/// Missing paths read as `null`; writes create intermediate objects.
#[derive(Debug)]
pub struct DataContainer {
    name: String,
    data: RwLock<Value>,
    attributes: RwLock<IndexMap<String, EntityId>>,
}

impl DataContainer {
    /// Empty container.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_data(name, Value::Object(Map::new()))
    }

    /// Container holding `data`.
    #[must_use]
    pub fn with_data(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(data),
            attributes: RwLock::new(IndexMap::new()),
        }
    }

    /// Prefix of the attribute names this container produces.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value at `path`, `null` when absent. The empty path is the whole document.
    #[must_use]
    pub fn get(&self, path: &str) -> Value {
        let data = self.data.read();
        if path.is_empty() {
            return data.clone();
        }
        let mut node = &*data;
        for key in path.split('.') {
            let next = match node {
                Value::Object(map) => map.get(key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(value) => node = value,
                None => return Value::Null,
            }
        }
        node.clone()
    }

    /// Stores `value` at `path`. Returns whether anything changed.
    pub fn set(&self, path: &str, value: Value) -> bool {
        let mut data = self.data.write();
        if path.is_empty() {
            if *data == value {
                return false;
            }
            *data = value;
            return true;
        }
        let (parents, leaf) = match path.rsplit_once('.') {
            Some((parents, leaf)) => (Some(parents), leaf),
            None => (None, path),
        };
        let mut node = &mut *data;
        for key in parents.into_iter().flat_map(|p| p.split('.')) {
            node = force_object(node)
                .entry(key)
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let map = force_object(node);
        if map.get(leaf) == Some(&value) {
            return false;
        }
        map.insert(leaf.to_string(), value);
        true
    }

    /// Replaces the whole document. Returns whether anything changed.
    pub fn replace(&self, data: Value) -> bool {
        self.set("", data)
    }

    /// Copy of the whole document.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.get("")
    }

    /// Attribute previously resolved for `path`.
    #[must_use]
    pub fn attribute_id(&self, path: &str) -> Option<EntityId> {
        self.attributes.read().get(path).copied()
    }

    fn attribute(&self, registry: &Registry, path: &str) -> EntityId {
        if let Some(id) = self.attribute_id(path) {
            return id;
        }
        let mut attributes = self.attributes.write();
        *attributes
            .entry(path.to_string())
            .or_insert_with(|| registry.register_attribute(&format!("{}.{path}", self.name)))
    }
}

fn force_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced by an object"),
    }
}

/// Clock, history and registry shared by every instrumented view of a cycle.
#[derive(Clone, Copy)]
pub(crate) struct Recorder<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) history: &'a dyn ExecutionHistory,
    pub(crate) clock: &'a dyn Clock,
}

impl<'a> Recorder<'a> {
    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Appends an instantaneous event.
    pub(crate) fn record(
        &self,
        from: EntityId,
        to: Option<EntityId>,
        value: Value,
    ) -> Result<State, HistoryError> {
        let state = State::instant(from, to, self.clock.now(), value);
        self.history.append(state.clone())?;
        Ok(state)
    }

    /// Appends an event that started at `activation`.
    pub(crate) fn record_since(
        &self,
        from: EntityId,
        to: Option<EntityId>,
        activation: Timestamp,
        value: Value,
    ) -> Result<State, HistoryError> {
        let state = State::new(from, to, activation, self.clock.now(), value);
        self.history.append(state.clone())?;
        Ok(state)
    }

    pub(crate) fn accessor(&self, container: &'a DataContainer, owner: EntityId) -> Accessor<'a> {
        Accessor {
            container,
            owner,
            recorder: *self,
        }
    }
}

/// Read view of a container bound to the rule that reads it.
pub struct Accessor<'a> {
    container: &'a DataContainer,
    owner: EntityId,
    recorder: Recorder<'a>,
}

impl Accessor<'_> {
    /// Reads `path`. A non-null result is recorded as `attribute -> rule`.
    pub fn get(&self, path: &str) -> EngineResult<Value> {
        let attribute = self.container.attribute(self.recorder.registry, path);
        self.recorder.registry.relate(attribute, self.owner);
        let value = self.container.get(path);
        if !value.is_null() {
            self.recorder
                .record(attribute, Some(self.owner), value.clone())?;
        }
        Ok(value)
    }

    /// Reads `path` as a number, `None` when absent or not numeric.
    pub fn number(&self, path: &str) -> EngineResult<Option<f64>> {
        Ok(self.get(path)?.as_f64())
    }

    /// Reads `path` as a boolean; absent reads as `false`.
    pub fn flag(&self, path: &str) -> EngineResult<bool> {
        Ok(self.get(path)?.as_bool().unwrap_or(false))
    }

    /// Rule this view records reads for.
    #[must_use]
    pub const fn owner(&self) -> EntityId {
        self.owner
    }
}

/// Write view of the belief container bound to a revision rule.
pub struct Mutator<'a> {
    container: &'a DataContainer,
    owner: EntityId,
    recorder: Recorder<'a>,
}

impl Mutator<'_> {
    /// Writes `path`. A change is recorded as `rule -> attribute`.
    pub fn set(&self, path: &str, value: Value) -> EngineResult<bool> {
        if !self.container.set(path, value.clone()) {
            return Ok(false);
        }
        let attribute = self.container.attribute(self.recorder.registry, path);
        self.recorder.registry.relate(attribute, self.owner);
        self.recorder.record(self.owner, Some(attribute), value)?;
        Ok(true)
    }
}

/// Everything a belief revision rule may touch during one cycle.
pub struct RevisionContext<'a> {
    env: Accessor<'a>,
    beliefs: Accessor<'a>,
    channel: Accessor<'a>,
    mutator: Mutator<'a>,
}

impl<'a> RevisionContext<'a> {
    pub(crate) fn new(
        recorder: Recorder<'a>,
        owner: EntityId,
        env: &'a DataContainer,
        beliefs: &'a DataContainer,
        channel: &'a DataContainer,
    ) -> Self {
        Self {
            env: recorder.accessor(env, owner),
            beliefs: recorder.accessor(beliefs, owner),
            channel: recorder.accessor(channel, owner),
            mutator: Mutator {
                container: beliefs,
                owner,
                recorder,
            },
        }
    }

    /// Environment snapshot of this cycle.
    #[must_use]
    pub const fn env(&self) -> &Accessor<'a> {
        &self.env
    }

    /// Current beliefs.
    #[must_use]
    pub const fn beliefs(&self) -> &Accessor<'a> {
        &self.beliefs
    }

    /// Inbound channel.
    #[must_use]
    pub const fn channel(&self) -> &Accessor<'a> {
        &self.channel
    }

    /// Updates a belief.
    pub fn set(&self, path: &str, value: Value) -> EngineResult<bool> {
        self.mutator.set(path, value)
    }
}

/// Read-only, unrecorded view handed to actions.
pub struct ActionContext<'a> {
    env: &'a DataContainer,
    beliefs: &'a DataContainer,
    clone: &'a GoalClone,
}

impl<'a> ActionContext<'a> {
    pub(crate) const fn new(
        env: &'a DataContainer,
        beliefs: &'a DataContainer,
        clone: &'a GoalClone,
    ) -> Self {
        Self {
            env,
            beliefs,
            clone,
        }
    }

    /// Environment value at `path`.
    #[must_use]
    pub fn env(&self, path: &str) -> Value {
        self.env.get(path)
    }

    /// Belief value at `path`.
    #[must_use]
    pub fn belief(&self, path: &str) -> Value {
        self.beliefs.get(path)
    }

    /// Goal instance being pursued.
    #[must_use]
    pub const fn clone_id(&self) -> CloneId {
        self.clone.clone_id
    }

    /// Priority the instance was scheduled with.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.clone.priority
    }
}

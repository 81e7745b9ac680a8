//! Sequential reasoning cycle of one agent.
//!
//! [`SequentialProcessor::deliberate`] revises beliefs and promotes goals,
//! [`SequentialProcessor::process_intentions`] drains the intention queue.
//! Both record every decision in the execution history.

mod deliberation;
mod scheduler;

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use anyhow::anyhow;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use telos_logging::LogLevel;
use uuid::Uuid;

use crate::{
    clock::{Clock, SystemClock},
    config::{EngineConfig, RuleFailurePolicy},
    container::{DataContainer, Recorder},
    entity::{EntityId, EntityKind},
    error::{EngineError, EngineResult},
    history::{ExecutionHistory, InMemoryExecutionHistory},
    intentions::IntentionQueue,
    model::GoalClone,
    registry::Registry,
    telemetry::EngineTelemetry,
};

pub use scheduler::select_plan;

/// Outcome of one deliberation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationReport {
    /// Cycle identifier, also stamped on log records.
    pub cycle: Uuid,
    /// Belief revision rules that completed.
    pub revised: usize,
    /// Instances that reached their final stage and were queued.
    pub promoted: Vec<GoalClone>,
    /// Instances whose promotion chain stopped early.
    pub halted: usize,
    /// Rule failures recorded under [`RuleFailurePolicy::Record`].
    pub rule_failures: usize,
}

/// Outcome of one intention drain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainReport {
    /// Cycle identifier, also stamped on log records.
    pub cycle: Uuid,
    /// Instances whose selected plan ran.
    pub executed: Vec<GoalClone>,
    /// Instances dropped by conflict resolution.
    pub discarded: Vec<GoalClone>,
    /// Actions that returned an error or panicked.
    pub failed_actions: usize,
    /// Instances without an eligible plan.
    pub skipped: Vec<GoalClone>,
}

/// Builder for [`SequentialProcessor`].
pub struct ProcessorBuilder {
    registry: Arc<Registry>,
    agent: EntityId,
    history: Option<Arc<dyn ExecutionHistory>>,
    clock: Option<Arc<dyn Clock>>,
    failure_policy: RuleFailurePolicy,
    telemetry: Option<EngineTelemetry>,
}

impl ProcessorBuilder {
    /// Uses `history` instead of a fresh in-memory store.
    #[must_use]
    pub fn history(mut self, history: Arc<dyn ExecutionHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Uses `clock` instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Reaction to failing rules.
    #[must_use]
    pub const fn failure_policy(mut self, policy: RuleFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Applies the `[rules]` section.
    #[must_use]
    pub const fn config(self, config: &EngineConfig) -> Self {
        self.failure_policy(config.rules.failure_policy)
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: EngineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds the processor after checking that the agent exists.
    pub fn build(self) -> EngineResult<SequentialProcessor> {
        self.registry.agent(self.agent)?;
        Ok(SequentialProcessor {
            registry: self.registry,
            agent: self.agent,
            history: self
                .history
                .unwrap_or_else(|| Arc::new(InMemoryExecutionHistory::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
            failure_policy: self.failure_policy,
            telemetry: self.telemetry,
            env: DataContainer::new("env"),
            intentions: IntentionQueue::new(),
            deliberation_gate: Mutex::new(()),
            drain_gate: Mutex::new(()),
        })
    }
}

/// Deliberation and intention processing for one agent.
pub struct SequentialProcessor {
    registry: Arc<Registry>,
    agent: EntityId,
    history: Arc<dyn ExecutionHistory>,
    clock: Arc<dyn Clock>,
    failure_policy: RuleFailurePolicy,
    telemetry: Option<EngineTelemetry>,
    env: DataContainer,
    intentions: IntentionQueue,
    deliberation_gate: Mutex<()>,
    drain_gate: Mutex<()>,
}

impl std::fmt::Debug for SequentialProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialProcessor")
            .field("agent", &self.agent)
            .field("failure_policy", &self.failure_policy)
            .field("queued", &self.intentions.len())
            .field("events", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl SequentialProcessor {
    /// Returns a builder for `agent`.
    #[must_use]
    pub fn builder(registry: Arc<Registry>, agent: EntityId) -> ProcessorBuilder {
        ProcessorBuilder {
            registry,
            agent,
            history: None,
            clock: None,
            failure_policy: RuleFailurePolicy::default(),
            telemetry: None,
        }
    }

    /// Entity definitions.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Agent this processor reasons for.
    #[must_use]
    pub const fn agent(&self) -> EntityId {
        self.agent
    }

    /// Execution history receiving every event.
    #[must_use]
    pub const fn history(&self) -> &Arc<dyn ExecutionHistory> {
        &self.history
    }

    /// Pending intentions.
    #[must_use]
    pub const fn intentions(&self) -> &IntentionQueue {
        &self.intentions
    }

    /// Environment snapshot of the latest deliberation.
    #[must_use]
    pub const fn environment(&self) -> &DataContainer {
        &self.env
    }

    /// Active rule failure policy.
    #[must_use]
    pub const fn failure_policy(&self) -> RuleFailurePolicy {
        self.failure_policy
    }

    fn recorder(&self) -> Recorder<'_> {
        Recorder {
            registry: self.registry.as_ref(),
            history: self.history.as_ref(),
            clock: self.clock.as_ref(),
        }
    }

    fn log(
        &self,
        level: LogLevel,
        message: &str,
        cycle: Uuid,
        entity: Option<EntityId>,
        metadata: Value,
    ) {
        if let Some(telemetry) = &self.telemetry {
            let mut record = telemetry
                .record(level, message)
                .with_cycle(cycle)
                .with_metadata(metadata);
            if let Some(entity) = entity {
                record = record.with_entity(entity.to_string());
            }
            if let Err(err) = telemetry.emit(&record) {
                tracing::warn!(error = %err, "telemetry sink failed");
            }
        }
    }

    /// Applies the configured policy to a failed belief revision or promotion rule.
    fn rule_failed(
        &self,
        cycle: Uuid,
        rule: EntityId,
        kind: EntityKind,
        err: &anyhow::Error,
    ) -> EngineResult<()> {
        self.log(
            LogLevel::Error,
            "deliberation.rule_failed",
            cycle,
            Some(rule),
            json!({ "kind": kind.label(), "error": err.to_string() }),
        );
        match self.failure_policy {
            RuleFailurePolicy::Propagate => Err(EngineError::RuleFailed {
                rule,
                kind,
                message: format!("{err:#}"),
            }),
            RuleFailurePolicy::Record => {
                self.recorder().record(
                    rule,
                    None,
                    json!({ "error": err.to_string(), "stack": format!("{err:?}") }),
                )?;
                Ok(())
            }
        }
    }
}

/// Runs user code, turning a panic into an error named after `what`.
fn guarded<T>(what: &str, run: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    panic::catch_unwind(AssertUnwindSafe(run))
        .unwrap_or_else(|payload| Err(anyhow!("{what} panicked: {}", panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}

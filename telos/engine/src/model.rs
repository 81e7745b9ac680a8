//! Domain objects: rules, goals, plans, actions, conflicts and agents.

use std::{fmt, sync::Arc};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::{
    container::{Accessor, ActionContext, DataContainer, RevisionContext},
    entity::{CloneId, EntityId, EntityMeta},
};

/// Scheduling priority of goals and plan thresholds.
pub type Priority = i64;

/// Updates beliefs from the environment, current beliefs and the channel.
pub trait BeliefRevision: Send + Sync {
    /// Applies the rule. Writes go through [`RevisionContext::set`].
    fn revise(&self, ctx: &RevisionContext<'_>) -> anyhow::Result<()>;
}

impl<F> BeliefRevision for F
where
    F: Fn(&RevisionContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn revise(&self, ctx: &RevisionContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// One promotion stage of a goal.
pub trait PromotionRule: Send + Sync {
    /// Returns the new priority, or `None` to halt the chain for this cycle.
    fn promote(&self, beliefs: &Accessor<'_>, priority: Priority)
        -> anyhow::Result<Option<Priority>>;
}

impl<F> PromotionRule for F
where
    F: Fn(&Accessor<'_>, Priority) -> anyhow::Result<Option<Priority>> + Send + Sync,
{
    fn promote(
        &self,
        beliefs: &Accessor<'_>,
        priority: Priority,
    ) -> anyhow::Result<Option<Priority>> {
        self(beliefs, priority)
    }
}

/// Side-effecting step of a plan. Failures are recorded, never propagated.
pub trait ActionRoutine: Send + Sync {
    /// Executes the step.
    fn run(&self, ctx: &ActionContext<'_>) -> anyhow::Result<()>;
}

impl<F> ActionRoutine for F
where
    F: Fn(&ActionContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, ctx: &ActionContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// Resolvable belief, environment or channel path, created on first use.
#[derive(Debug, Clone)]
pub struct Attribute {
    /// Identity; `name` holds `<container>.<path>`.
    pub meta: EntityMeta,
    /// Rules whose reads or writes went through this path.
    pub relations: IndexSet<EntityId>,
}

/// Belief revision rule.
#[derive(Clone)]
pub struct BeliefReviewFunction {
    /// Identity.
    pub meta: EntityMeta,
    pub(crate) rule: Arc<dyn BeliefRevision>,
    /// Owning agents.
    pub agents: Vec<EntityId>,
}

impl fmt::Debug for BeliefReviewFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeliefReviewFunction")
            .field("meta", &self.meta)
            .field("agents", &self.agents)
            .finish_non_exhaustive()
    }
}

/// Named promotion stage shared by one or more goals.
#[derive(Clone)]
pub struct GoalPromotion {
    /// Identity; `name` holds the stage name.
    pub meta: EntityMeta,
    pub(crate) rule: Arc<dyn PromotionRule>,
    /// Goals using this stage.
    pub goals: Vec<EntityId>,
}

impl GoalPromotion {
    /// Stage name appended to a clone's status when the stage fires.
    #[must_use]
    pub fn stage(&self) -> &str {
        self.meta.name.as_deref().unwrap_or_default()
    }
}

impl fmt::Debug for GoalPromotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoalPromotion")
            .field("meta", &self.meta)
            .field("goals", &self.goals)
            .finish_non_exhaustive()
    }
}

/// Ordered actions guarded by a minimum goal priority.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Identity.
    pub meta: EntityMeta,
    /// Minimum clone priority for the plan to be eligible.
    pub priority: Priority,
    /// Steps, executed in order.
    pub actions: Vec<EntityId>,
    /// Goals offering this plan.
    pub goals: Vec<EntityId>,
}

/// Side-effecting routine bound to one or more plans.
#[derive(Clone)]
pub struct Action {
    /// Identity.
    pub meta: EntityMeta,
    pub(crate) routine: Arc<dyn ActionRoutine>,
    /// Plans containing this action.
    pub plans: Vec<EntityId>,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("meta", &self.meta)
            .field("plans", &self.plans)
            .finish_non_exhaustive()
    }
}

/// Goal template; every deliberation cycle schedules a fresh [`GoalClone`].
#[derive(Debug, Clone)]
pub struct Goal {
    /// Identity.
    pub meta: EntityMeta,
    /// Promotion stages, in the order they must fire.
    pub promotions: Vec<EntityId>,
    /// Candidate plans.
    pub plans: Vec<EntityId>,
    /// Conflicts this goal participates in.
    pub conflicts: Vec<EntityId>,
    /// Owning agents.
    pub agents: Vec<EntityId>,
}

/// Goals that must not be pursued together.
#[derive(Debug, Clone)]
pub struct Conflict {
    /// Identity.
    pub meta: EntityMeta,
    /// Mutually exclusive goal templates.
    pub goals: IndexSet<EntityId>,
    /// Owning agents.
    pub agents: Vec<EntityId>,
}

/// Beliefs, channel, rules and goals of one reasoning agent.
#[derive(Debug)]
pub struct Agent {
    /// Identity.
    pub meta: EntityMeta,
    /// Internal belief store.
    pub beliefs: DataContainer,
    /// Inbound message channel.
    pub channel: DataContainer,
    /// Belief revision rules, applied in this order.
    pub brfs: Vec<EntityId>,
    /// Goal templates, cloned in this order every cycle.
    pub goals: Vec<EntityId>,
    /// Conflicts considered by the scheduler.
    pub conflicts: Vec<EntityId>,
}

/// Per-cycle scheduling instance of a goal template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalClone {
    /// Instance identifier.
    pub clone_id: CloneId,
    /// Template identifier.
    pub goal: EntityId,
    /// Running priority.
    pub priority: Priority,
    /// Stages fired this cycle, in order.
    pub status: Vec<String>,
}

impl GoalClone {
    /// Fresh instance with priority 0 and no fired stages.
    #[must_use]
    pub fn of(goal: &Goal) -> Self {
        Self {
            clone_id: CloneId::generate(),
            goal: goal.meta.id,
            priority: 0,
            status: Vec::new(),
        }
    }

    /// Records a fired stage and the resulting priority.
    pub fn promote(&mut self, stage: impl Into<String>, priority: Priority) {
        self.status.push(stage.into());
        self.priority = priority;
    }

    /// Whether every stage of `template` fired this cycle.
    #[must_use]
    pub fn is_final(&self, template: &Goal) -> bool {
        self.status.len() == template.promotions.len()
    }
}

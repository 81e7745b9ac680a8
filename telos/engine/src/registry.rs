//! Explicit context owning every entity definition of a run.
//!
//! Definitions are fixed once [`ModelBuilder::build`] returns. Attributes and
//! their relations to rules appear lazily while rules read and write data, so
//! they live behind a lock.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;

use crate::{
    container::{Accessor, ActionContext, DataContainer, RevisionContext},
    entity::{EntityId, EntityKind, EntityMeta},
    error::ModelError,
    model::{
        Action, ActionRoutine, Agent, Attribute, BeliefReviewFunction, BeliefRevision, Conflict,
        Goal, GoalPromotion, Plan, Priority, PromotionRule,
    },
};

/// Maps an entity to the entities whose recorded events can explain it.
pub trait CausalModel: Send + Sync {
    /// Causal predecessors of `id`; empty for unknown entities.
    fn predecessors(&self, id: EntityId) -> Vec<EntityId>;
}

#[derive(Debug, Default)]
struct AttributeGraph {
    attributes: IndexMap<EntityId, Attribute>,
    touched: HashMap<EntityId, IndexSet<EntityId>>,
}

/// Entity definitions plus the attribute graph grown during a run.
#[derive(Debug, Default)]
pub struct Registry {
    brfs: IndexMap<EntityId, BeliefReviewFunction>,
    promotions: IndexMap<EntityId, GoalPromotion>,
    plans: IndexMap<EntityId, Plan>,
    actions: IndexMap<EntityId, Action>,
    goals: IndexMap<EntityId, Goal>,
    conflicts: IndexMap<EntityId, Conflict>,
    agents: IndexMap<EntityId, Agent>,
    graph: RwLock<AttributeGraph>,
}

impl Registry {
    /// Kind of a registered entity.
    #[must_use]
    pub fn kind(&self, id: EntityId) -> Option<EntityKind> {
        self.meta(id).map(|meta| meta.kind)
    }

    /// Identity record of any registered entity.
    #[must_use]
    pub fn meta(&self, id: EntityId) -> Option<EntityMeta> {
        self.static_meta(id).cloned().or_else(|| {
            self.graph
                .read()
                .attributes
                .get(&id)
                .map(|attribute| attribute.meta.clone())
        })
    }

    /// `Kind: name - desc`, or `unknown <id>`.
    #[must_use]
    pub fn describe(&self, id: EntityId) -> String {
        self.meta(id)
            .map_or_else(|| format!("unknown {id}"), |meta| meta.describe())
    }

    fn static_meta(&self, id: EntityId) -> Option<&EntityMeta> {
        self.brfs
            .get(&id)
            .map(|e| &e.meta)
            .or_else(|| self.promotions.get(&id).map(|e| &e.meta))
            .or_else(|| self.plans.get(&id).map(|e| &e.meta))
            .or_else(|| self.actions.get(&id).map(|e| &e.meta))
            .or_else(|| self.goals.get(&id).map(|e| &e.meta))
            .or_else(|| self.conflicts.get(&id).map(|e| &e.meta))
            .or_else(|| self.agents.get(&id).map(|e| &e.meta))
    }

    fn missing(&self, id: EntityId, expected: EntityKind) -> ModelError {
        match self.kind(id) {
            Some(actual) => ModelError::WrongKind {
                id,
                expected,
                actual,
            },
            None => ModelError::UnknownEntity(id),
        }
    }

    /// Belief revision rule by id.
    pub fn brf(&self, id: EntityId) -> Result<&BeliefReviewFunction, ModelError> {
        self.brfs
            .get(&id)
            .ok_or_else(|| self.missing(id, EntityKind::BeliefReviewFunction))
    }

    /// Promotion stage by id.
    pub fn promotion(&self, id: EntityId) -> Result<&GoalPromotion, ModelError> {
        self.promotions
            .get(&id)
            .ok_or_else(|| self.missing(id, EntityKind::GoalPromotion))
    }

    /// Plan by id.
    pub fn plan(&self, id: EntityId) -> Result<&Plan, ModelError> {
        self.plans
            .get(&id)
            .ok_or_else(|| self.missing(id, EntityKind::Plan))
    }

    /// Action by id.
    pub fn action(&self, id: EntityId) -> Result<&Action, ModelError> {
        self.actions
            .get(&id)
            .ok_or_else(|| self.missing(id, EntityKind::Action))
    }

    /// Goal template by id.
    pub fn goal(&self, id: EntityId) -> Result<&Goal, ModelError> {
        self.goals
            .get(&id)
            .ok_or_else(|| self.missing(id, EntityKind::Goal))
    }

    /// Conflict by id.
    pub fn conflict(&self, id: EntityId) -> Result<&Conflict, ModelError> {
        self.conflicts
            .get(&id)
            .ok_or_else(|| self.missing(id, EntityKind::Conflict))
    }

    /// Agent by id.
    pub fn agent(&self, id: EntityId) -> Result<&Agent, ModelError> {
        self.agents
            .get(&id)
            .ok_or_else(|| self.missing(id, EntityKind::Agent))
    }

    /// Every registered agent, in declaration order.
    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    /// Snapshot of an attribute.
    #[must_use]
    pub fn attribute(&self, id: EntityId) -> Option<Attribute> {
        self.graph.read().attributes.get(&id).cloned()
    }

    /// Attribute id by its full `<container>.<path>` name.
    #[must_use]
    pub fn attribute_named(&self, name: &str) -> Option<EntityId> {
        self.graph
            .read()
            .attributes
            .values()
            .find(|attribute| attribute.meta.name.as_deref() == Some(name))
            .map(|attribute| attribute.meta.id)
    }

    /// Attributes read or written by a rule.
    #[must_use]
    pub fn touched_by(&self, rule: EntityId) -> Vec<EntityId> {
        self.graph
            .read()
            .touched
            .get(&rule)
            .map(|attrs| attrs.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn register_attribute(&self, name: &str) -> EntityId {
        let meta = EntityMeta::new(EntityKind::Attribute, "").named(name);
        let id = meta.id;
        self.graph.write().attributes.insert(
            id,
            Attribute {
                meta,
                relations: IndexSet::new(),
            },
        );
        id
    }

    /// Links an attribute and a rule in both directions.
    pub(crate) fn relate(&self, attribute: EntityId, rule: EntityId) {
        let mut graph = self.graph.write();
        if let Some(entry) = graph.attributes.get_mut(&attribute) {
            entry.relations.insert(rule);
        }
        graph.touched.entry(rule).or_default().insert(attribute);
    }
}

impl CausalModel for Registry {
    fn predecessors(&self, id: EntityId) -> Vec<EntityId> {
        match self.kind(id) {
            Some(EntityKind::Attribute) => self
                .attribute(id)
                .map(|attribute| attribute.relations.into_iter().collect())
                .unwrap_or_default(),
            Some(EntityKind::BeliefReviewFunction | EntityKind::GoalPromotion) => {
                self.touched_by(id)
            }
            Some(EntityKind::Action) => self
                .actions
                .get(&id)
                .map(|action| action.plans.clone())
                .unwrap_or_default(),
            Some(EntityKind::Plan) => self
                .plans
                .get(&id)
                .map(|plan| plan.goals.clone())
                .unwrap_or_default(),
            Some(EntityKind::Goal) => self
                .goals
                .get(&id)
                .map(|goal| {
                    goal.conflicts
                        .iter()
                        .chain(&goal.promotions)
                        .copied()
                        .collect()
                })
                .unwrap_or_default(),
            Some(EntityKind::Conflict) => self
                .conflicts
                .get(&id)
                .map(|conflict| conflict.goals.iter().copied().collect())
                .unwrap_or_default(),
            Some(EntityKind::Agent) | None => Vec::new(),
        }
    }
}

/// Containers and members of an agent handed to [`ModelBuilder::agent`].
#[derive(Debug)]
pub struct AgentSpec {
    /// Description.
    pub desc: String,
    /// Initial beliefs.
    pub beliefs: DataContainer,
    /// Inbound channel.
    pub channel: DataContainer,
    /// Belief revision rules.
    pub brfs: Vec<EntityId>,
    /// Goal templates.
    pub goals: Vec<EntityId>,
    /// Conflicts.
    pub conflicts: Vec<EntityId>,
}

impl AgentSpec {
    /// Spec with empty `beliefs` and `channel` containers.
    #[must_use]
    pub fn new(desc: impl Into<String>) -> Self {
        Self {
            desc: desc.into(),
            beliefs: DataContainer::new("beliefs"),
            channel: DataContainer::new("channel"),
            brfs: Vec::new(),
            goals: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    /// Replaces the belief container.
    #[must_use]
    pub fn beliefs(mut self, beliefs: DataContainer) -> Self {
        self.beliefs = beliefs;
        self
    }

    /// Replaces the channel container.
    #[must_use]
    pub fn channel(mut self, channel: DataContainer) -> Self {
        self.channel = channel;
        self
    }

    /// Sets the belief revision rules.
    #[must_use]
    pub fn brfs(mut self, brfs: impl IntoIterator<Item = EntityId>) -> Self {
        self.brfs = brfs.into_iter().collect();
        self
    }

    /// Sets the goal templates.
    #[must_use]
    pub fn goals(mut self, goals: impl IntoIterator<Item = EntityId>) -> Self {
        self.goals = goals.into_iter().collect();
        self
    }

    /// Sets the conflicts.
    #[must_use]
    pub fn conflicts(mut self, conflicts: impl IntoIterator<Item = EntityId>) -> Self {
        self.conflicts = conflicts.into_iter().collect();
        self
    }
}

/// Registers entities and wires their back-references.
#[derive(Debug, Default)]
pub struct ModelBuilder {
    registry: Registry,
}

impl ModelBuilder {
    /// Empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a belief revision closure.
    pub fn belief_revision<F>(&mut self, desc: impl Into<String>, rule: F) -> EntityId
    where
        F: Fn(&RevisionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.belief_revision_rule(desc, Arc::new(rule))
    }

    /// Registers a belief revision rule object.
    pub fn belief_revision_rule(
        &mut self,
        desc: impl Into<String>,
        rule: Arc<dyn BeliefRevision>,
    ) -> EntityId {
        let meta = EntityMeta::new(EntityKind::BeliefReviewFunction, desc);
        let id = meta.id;
        self.registry.brfs.insert(
            id,
            BeliefReviewFunction {
                meta,
                rule,
                agents: Vec::new(),
            },
        );
        id
    }

    /// Registers a promotion stage closure.
    pub fn promotion<F>(
        &mut self,
        stage: impl Into<String>,
        desc: impl Into<String>,
        rule: F,
    ) -> EntityId
    where
        F: Fn(&Accessor<'_>, Priority) -> anyhow::Result<Option<Priority>> + Send + Sync + 'static,
    {
        self.promotion_rule(stage, desc, Arc::new(rule))
    }

    /// Registers a promotion stage rule object.
    pub fn promotion_rule(
        &mut self,
        stage: impl Into<String>,
        desc: impl Into<String>,
        rule: Arc<dyn PromotionRule>,
    ) -> EntityId {
        let meta = EntityMeta::new(EntityKind::GoalPromotion, desc).named(stage);
        let id = meta.id;
        self.registry.promotions.insert(
            id,
            GoalPromotion {
                meta,
                rule,
                goals: Vec::new(),
            },
        );
        id
    }

    /// Registers an action closure.
    pub fn action<F>(&mut self, desc: impl Into<String>, routine: F) -> EntityId
    where
        F: Fn(&ActionContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.action_routine(desc, Arc::new(routine))
    }

    /// Registers an action routine object.
    pub fn action_routine(
        &mut self,
        desc: impl Into<String>,
        routine: Arc<dyn ActionRoutine>,
    ) -> EntityId {
        let meta = EntityMeta::new(EntityKind::Action, desc);
        let id = meta.id;
        self.registry.actions.insert(
            id,
            Action {
                meta,
                routine,
                plans: Vec::new(),
            },
        );
        id
    }

    /// Registers a plan over already registered actions.
    pub fn plan(
        &mut self,
        priority: Priority,
        actions: impl IntoIterator<Item = EntityId>,
        desc: impl Into<String>,
    ) -> Result<EntityId, ModelError> {
        let actions: Vec<EntityId> = actions.into_iter().collect();
        let meta = EntityMeta::new(EntityKind::Plan, desc);
        let id = meta.id;
        for action in &actions {
            self.registry
                .actions
                .get_mut(action)
                .ok_or(ModelError::UnknownEntity(*action))?
                .plans
                .push(id);
        }
        self.registry.plans.insert(
            id,
            Plan {
                meta,
                priority,
                actions,
                goals: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Registers a goal template over registered promotions and plans.
    pub fn goal(
        &mut self,
        promotions: impl IntoIterator<Item = EntityId>,
        plans: impl IntoIterator<Item = EntityId>,
        desc: impl Into<String>,
    ) -> Result<EntityId, ModelError> {
        let promotions: Vec<EntityId> = promotions.into_iter().collect();
        let plans: Vec<EntityId> = plans.into_iter().collect();
        let meta = EntityMeta::new(EntityKind::Goal, desc);
        let id = meta.id;
        for promotion in &promotions {
            if !self.registry.promotions.contains_key(promotion) {
                return Err(ModelError::UnknownEntity(*promotion));
            }
        }
        for plan in &plans {
            if !self.registry.plans.contains_key(plan) {
                return Err(ModelError::UnknownEntity(*plan));
            }
        }
        for promotion in &promotions {
            if let Some(entry) = self.registry.promotions.get_mut(promotion) {
                entry.goals.push(id);
            }
        }
        for plan in &plans {
            if let Some(entry) = self.registry.plans.get_mut(plan) {
                entry.goals.push(id);
            }
        }
        self.registry.goals.insert(
            id,
            Goal {
                meta,
                promotions,
                plans,
                conflicts: Vec::new(),
                agents: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Registers a conflict between goal templates.
    pub fn conflict(
        &mut self,
        goals: impl IntoIterator<Item = EntityId>,
        desc: impl Into<String>,
    ) -> Result<EntityId, ModelError> {
        let goals: IndexSet<EntityId> = goals.into_iter().collect();
        if goals.len() < 2 {
            return Err(ModelError::Invalid(
                "a conflict needs at least two distinct goals".into(),
            ));
        }
        let meta = EntityMeta::new(EntityKind::Conflict, desc);
        let id = meta.id;
        for goal in &goals {
            self.registry
                .goals
                .get_mut(goal)
                .ok_or(ModelError::UnknownEntity(*goal))?
                .conflicts
                .push(id);
        }
        self.registry.conflicts.insert(
            id,
            Conflict {
                meta,
                goals,
                agents: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Registers an agent owning previously registered rules and goals.
    pub fn agent(&mut self, spec: AgentSpec) -> Result<EntityId, ModelError> {
        let registry = &mut self.registry;
        let mut seen = HashSet::new();
        for member in spec.brfs.iter().chain(&spec.goals).chain(&spec.conflicts) {
            if !seen.insert(*member) {
                return Err(ModelError::Duplicate(*member));
            }
        }
        for brf in &spec.brfs {
            if !registry.brfs.contains_key(brf) {
                return Err(registry.missing(*brf, EntityKind::BeliefReviewFunction));
            }
        }
        for goal in &spec.goals {
            if !registry.goals.contains_key(goal) {
                return Err(registry.missing(*goal, EntityKind::Goal));
            }
        }
        for conflict in &spec.conflicts {
            if !registry.conflicts.contains_key(conflict) {
                return Err(registry.missing(*conflict, EntityKind::Conflict));
            }
        }

        let meta = EntityMeta::new(EntityKind::Agent, spec.desc);
        let id = meta.id;
        for brf in &spec.brfs {
            if let Some(entry) = registry.brfs.get_mut(brf) {
                entry.agents.push(id);
            }
        }
        for goal in &spec.goals {
            if let Some(entry) = registry.goals.get_mut(goal) {
                entry.agents.push(id);
            }
        }
        for conflict in &spec.conflicts {
            if let Some(entry) = registry.conflicts.get_mut(conflict) {
                entry.agents.push(id);
            }
        }
        registry.agents.insert(
            id,
            Agent {
                meta,
                beliefs: spec.beliefs,
                channel: spec.channel,
                brfs: spec.brfs,
                goals: spec.goals,
                conflicts: spec.conflicts,
            },
        );
        Ok(id)
    }

    /// Freezes the definitions.
    #[must_use]
    pub fn build(self) -> Arc<Registry> {
        Arc::new(self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_action(builder: &mut ModelBuilder) -> EntityId {
        builder.action("noop", |_ctx: &ActionContext<'_>| Ok(()))
    }

    #[test]
    fn back_references_are_wired() {
        let mut builder = ModelBuilder::new();
        let action = noop_action(&mut builder);
        let plan = builder.plan(0, [action], "p").unwrap();
        let stage = builder.promotion("executive", "", |_b: &Accessor<'_>, p| Ok(Some(p)));
        let goal_a = builder.goal([stage], [plan], "a").unwrap();
        let goal_b = builder.goal([stage], [], "b").unwrap();
        let conflict = builder.conflict([goal_a, goal_b], "exclusive").unwrap();
        let agent = builder
            .agent(AgentSpec::new("rover").goals([goal_a, goal_b]).conflicts([conflict]))
            .unwrap();
        let registry = builder.build();

        assert_eq!(registry.action(action).unwrap().plans, vec![plan]);
        assert_eq!(registry.plan(plan).unwrap().goals, vec![goal_a]);
        assert_eq!(registry.promotion(stage).unwrap().goals, vec![goal_a, goal_b]);
        assert_eq!(registry.goal(goal_b).unwrap().conflicts, vec![conflict]);
        assert_eq!(registry.conflict(conflict).unwrap().agents, vec![agent]);
        assert_eq!(registry.goal(goal_a).unwrap().agents, vec![agent]);
    }

    #[test]
    fn lookups_report_kind_mismatches() {
        let mut builder = ModelBuilder::new();
        let action = noop_action(&mut builder);
        let registry = builder.build();
        assert!(matches!(
            registry.goal(action),
            Err(ModelError::WrongKind {
                expected: EntityKind::Goal,
                actual: EntityKind::Action,
                ..
            })
        ));
        let stranger = EntityId::generate();
        assert_eq!(
            registry.plan(stranger).unwrap_err(),
            ModelError::UnknownEntity(stranger)
        );
        assert!(registry.describe(stranger).starts_with("unknown"));
    }

    #[test]
    fn unknown_members_are_rejected() {
        let mut builder = ModelBuilder::new();
        assert!(builder.plan(0, [EntityId::generate()], "p").is_err());
        let goal = builder.goal([], [], "only").unwrap();
        assert!(matches!(
            builder.conflict([goal, goal], "self"),
            Err(ModelError::Invalid(_))
        ));
    }

    #[test]
    fn agents_reject_repeated_or_foreign_members() {
        let mut builder = ModelBuilder::new();
        let goal = builder.goal([], [], "only").unwrap();
        assert_eq!(
            builder
                .agent(AgentSpec::new("twice").goals([goal, goal]))
                .unwrap_err(),
            ModelError::Duplicate(goal)
        );
        let action = noop_action(&mut builder);
        assert!(matches!(
            builder.agent(AgentSpec::new("odd").goals([action])),
            Err(ModelError::WrongKind { expected: EntityKind::Goal, .. })
        ));
        let registry = builder.build();
        assert!(registry.goal(goal).unwrap().agents.is_empty());
    }

    #[test]
    fn causal_predecessors_follow_the_domain_graph() {
        let mut builder = ModelBuilder::new();
        let action = noop_action(&mut builder);
        let plan = builder.plan(0, [action], "p").unwrap();
        let stage = builder.promotion("executive", "", |_b: &Accessor<'_>, p| Ok(Some(p)));
        let goal_a = builder.goal([stage], [plan], "a").unwrap();
        let goal_b = builder.goal([], [], "b").unwrap();
        let conflict = builder.conflict([goal_a, goal_b], "").unwrap();
        let registry = builder.build();

        let attribute = registry.register_attribute("beliefs.resources.battery");
        registry.relate(attribute, stage);

        assert_eq!(registry.predecessors(action), vec![plan]);
        assert_eq!(registry.predecessors(plan), vec![goal_a]);
        assert_eq!(registry.predecessors(goal_a), vec![conflict, stage]);
        assert_eq!(registry.predecessors(conflict), vec![goal_a, goal_b]);
        assert_eq!(registry.predecessors(stage), vec![attribute]);
        assert_eq!(registry.predecessors(attribute), vec![stage]);
        assert!(registry.predecessors(EntityId::generate()).is_empty());
        assert_eq!(
            registry.attribute_named("beliefs.resources.battery"),
            Some(attribute)
        );
    }
}

use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;
use serde_json::json;
use telos_logging::LogLevel;
use tracing::instrument;
use uuid::Uuid;

use super::{guarded, DrainReport, SequentialProcessor};
use crate::{
    container::ActionContext,
    entity::{CloneId, EntityId},
    error::EngineResult,
    model::{Agent, GoalClone, Plan, Priority},
};

/// Highest-threshold plan that `priority` satisfies. Among equal thresholds
/// the earliest plan wins.
#[must_use]
pub fn select_plan<'p>(
    plans: impl IntoIterator<Item = &'p Plan>,
    priority: Priority,
) -> Option<&'p Plan> {
    plans
        .into_iter()
        .filter(|plan| plan.priority <= priority)
        .fold(None::<&'p Plan>, |best, plan| match best {
            Some(best) if best.priority >= plan.priority => Some(best),
            _ => Some(plan),
        })
}

/// Winner and losers of one conflict within the pending batch.
#[derive(Debug)]
struct Verdict {
    chosen: CloneId,
    losers: Vec<CloneId>,
}

impl SequentialProcessor {
    /// Drains the intention queue once.
    ///
    /// Instances are taken highest priority first. Before each pop, conflicts
    /// are detected over what remains: the first instance of a conflict wins
    /// and the others are discarded. Survivors run the plan returned by
    /// [`select_plan`]; action failures are recorded and never abort the drain.
    #[instrument(skip(self), fields(agent = %self.agent))]
    pub fn process_intentions(&self) -> EngineResult<DrainReport> {
        let _gate = self.drain_gate.lock();
        let cycle = Uuid::new_v4();
        let agent = self.registry.agent(self.agent)?;
        let mut batch: VecDeque<GoalClone> = self.intentions.take_all().into();
        let mut removed: HashSet<CloneId> = HashSet::new();
        let mut report = DrainReport {
            cycle,
            executed: Vec::new(),
            discarded: Vec::new(),
            failed_actions: 0,
            skipped: Vec::new(),
        };

        if let Err(err) = self.drain_batch(cycle, agent, &mut batch, &mut removed, &mut report) {
            let requeued: Vec<GoalClone> = batch
                .into_iter()
                .filter(|clone| !removed.contains(&clone.clone_id))
                .collect();
            self.log(
                LogLevel::Error,
                "intentions.drain_aborted",
                cycle,
                Some(self.agent),
                json!({ "requeued": requeued.len(), "error": err.to_string() }),
            );
            self.intentions.extend(requeued);
            return Err(err);
        }

        self.log(
            LogLevel::Info,
            "intentions.drained",
            cycle,
            Some(self.agent),
            json!({
                "executed": report.executed.len(),
                "discarded": report.discarded.len(),
                "skipped": report.skipped.len(),
                "failedActions": report.failed_actions,
            }),
        );
        Ok(report)
    }

    /// Works through `batch` until it is empty. An instance stays at the
    /// front of `batch` until its outcome is recorded, so on error whatever
    /// is left has not started.
    fn drain_batch(
        &self,
        cycle: Uuid,
        agent: &Agent,
        batch: &mut VecDeque<GoalClone>,
        removed: &mut HashSet<CloneId>,
        report: &mut DrainReport,
    ) -> EngineResult<()> {
        let recorder = self.recorder();
        loop {
            let detected = self.detect_conflicts(agent, batch.make_contiguous(), removed)?;
            let Some(clone) = batch.front().cloned() else {
                break;
            };
            let goal = self.registry.goal(clone.goal)?;

            if !removed.contains(&clone.clone_id) {
                for conflict in &goal.conflicts {
                    let Some(verdict) = detected.get(conflict) else {
                        continue;
                    };
                    for loser in &verdict.losers {
                        recorder.record(
                            *conflict,
                            None,
                            json!({ "chosen": verdict.chosen, "removed": loser }),
                        )?;
                        removed.insert(*loser);
                        self.log(
                            LogLevel::Info,
                            "intentions.conflict_resolved",
                            cycle,
                            Some(*conflict),
                            json!({ "chosen": verdict.chosen, "removed": loser }),
                        );
                    }
                }
            }
            if removed.remove(&clone.clone_id) {
                batch.pop_front();
                report.discarded.push(clone);
                continue;
            }

            let plans = goal
                .plans
                .iter()
                .map(|id| self.registry.plan(*id))
                .collect::<Result<Vec<_>, _>>()?;
            let Some(plan) = select_plan(plans, clone.priority) else {
                recorder.record(
                    goal.meta.id,
                    None,
                    json!({
                        "cloneId": clone.clone_id,
                        "priority": clone.priority,
                        "reason": "no eligible plan",
                    }),
                )?;
                self.log(
                    LogLevel::Warn,
                    "intentions.no_eligible_plan",
                    cycle,
                    Some(goal.meta.id),
                    json!({ "cloneId": clone.clone_id, "priority": clone.priority }),
                );
                batch.pop_front();
                report.skipped.push(clone);
                continue;
            };

            recorder.record(
                goal.meta.id,
                Some(plan.meta.id),
                json!({ "cloneId": clone.clone_id, "priority": clone.priority }),
            )?;
            batch.pop_front();
            self.log(
                LogLevel::Debug,
                "intentions.plan_selected",
                cycle,
                Some(plan.meta.id),
                json!({ "cloneId": clone.clone_id, "priority": clone.priority }),
            );
            report.failed_actions += self.execute_plan(cycle, agent, plan, &clone)?;
            report.executed.push(clone);
        }
        Ok(())
    }

    /// Conflicts with at least two live instances in `pending`, keyed by conflict.
    fn detect_conflicts(
        &self,
        agent: &Agent,
        pending: &[GoalClone],
        removed: &HashSet<CloneId>,
    ) -> EngineResult<IndexMap<EntityId, Verdict>> {
        let mut detected = IndexMap::new();
        for &conflict_id in &agent.conflicts {
            let conflict = self.registry.conflict(conflict_id)?;
            let mut members = pending
                .iter()
                .filter(|clone| !removed.contains(&clone.clone_id))
                .filter(|clone| conflict.goals.contains(&clone.goal))
                .map(|clone| clone.clone_id);
            let Some(chosen) = members.next() else {
                continue;
            };
            let losers: Vec<CloneId> = members.collect();
            if !losers.is_empty() {
                detected.insert(conflict_id, Verdict { chosen, losers });
            }
        }
        Ok(detected)
    }

    /// Runs every action of `plan`, returning how many failed.
    fn execute_plan(
        &self,
        cycle: Uuid,
        agent: &Agent,
        plan: &Plan,
        clone: &GoalClone,
    ) -> EngineResult<usize> {
        let recorder = self.recorder();
        let ctx = ActionContext::new(&self.env, &agent.beliefs, clone);
        let mut failures = 0;
        for &action_id in &plan.actions {
            let action = self.registry.action(action_id)?;
            let started = recorder.now();
            let outcome = guarded("action", || action.routine.run(&ctx));
            let value = match outcome {
                Ok(()) => json!({ "cloneId": clone.clone_id }),
                Err(err) => {
                    failures += 1;
                    self.log(
                        LogLevel::Warn,
                        "intentions.action_failed",
                        cycle,
                        Some(action_id),
                        json!({ "cloneId": clone.clone_id, "error": err.to_string() }),
                    );
                    json!({
                        "cloneId": clone.clone_id,
                        "error": err.to_string(),
                        "stack": format!("{err:?}"),
                    })
                }
            };
            recorder.record_since(plan.meta.id, Some(action_id), started, value)?;
        }
        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use anyhow::anyhow;
    use serde_json::json;

    use super::*;
    use crate::{
        clock::{ManualClock, Timestamp},
        container::Accessor,
        entity::{EntityKind, EntityMeta},
        error::{EngineError, HistoryError},
        history::{ExecutionHistory, HistoryFilter, InMemoryExecutionHistory, State},
        registry::{AgentSpec, ModelBuilder},
    };

    /// Accepts `budget` appends, then rejects everything.
    struct Exhausted {
        inner: InMemoryExecutionHistory,
        budget: AtomicUsize,
    }

    impl ExecutionHistory for Exhausted {
        fn append(&self, state: State) -> Result<(), HistoryError> {
            let left = self.budget.load(Ordering::SeqCst);
            if left == 0 {
                return Err(HistoryError::Rejected("store full".into()));
            }
            self.budget.store(left - 1, Ordering::SeqCst);
            self.inner.append(state)
        }

        fn query(&self, filter: &HistoryFilter) -> Result<Vec<State>, HistoryError> {
            self.inner.query(filter)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    fn plan(priority: Priority) -> Plan {
        Plan {
            meta: EntityMeta::new(EntityKind::Plan, format!("threshold {priority}")),
            priority,
            actions: Vec::new(),
            goals: Vec::new(),
        }
    }

    fn fixed(
        priority: Priority,
    ) -> impl Fn(&Accessor<'_>, Priority) -> anyhow::Result<Option<Priority>> {
        move |_beliefs: &Accessor<'_>, _current: Priority| Ok(Some(priority))
    }

    fn processor_for(
        builder: ModelBuilder,
        agent: EntityId,
    ) -> (SequentialProcessor, Arc<InMemoryExecutionHistory>) {
        let history = Arc::new(InMemoryExecutionHistory::new());
        let processor = SequentialProcessor::builder(builder.build(), agent)
            .history(history.clone())
            .clock(Arc::new(ManualClock::default()))
            .build()
            .unwrap();
        (processor, history)
    }

    #[test]
    fn selects_highest_satisfied_threshold() {
        let plans = [plan(0), plan(5), plan(3), plan(5)];
        assert_eq!(select_plan(&plans, 4).unwrap().meta.id, plans[2].meta.id);
        assert_eq!(select_plan(&plans, 9).unwrap().meta.id, plans[1].meta.id);
        assert_eq!(select_plan(&plans, 0).unwrap().meta.id, plans[0].meta.id);
        assert!(select_plan(&plans[1..], 2).is_none());
        let none: [Plan; 0] = [];
        assert!(select_plan(&none, 10).is_none());
    }

    #[test]
    fn conflict_keeps_the_higher_priority_goal() {
        let mut builder = ModelBuilder::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let act = builder.action("act", move |_ctx: &ActionContext<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let plan = builder.plan(0, [act], "p").unwrap();
        let high = builder.promotion("executive", "", fixed(5));
        let low = builder.promotion("executive", "", fixed(2));
        let strong = builder.goal([high], [plan], "strong").unwrap();
        let weak = builder.goal([low], [plan], "weak").unwrap();
        let conflict = builder.conflict([strong, weak], "exclusive").unwrap();
        let agent = builder
            .agent(AgentSpec::new("a").goals([weak, strong]).conflicts([conflict]))
            .unwrap();
        let (processor, history) = processor_for(builder, agent);

        let deliberation = processor.deliberate(json!({})).unwrap();
        let strong_clone = deliberation
            .promoted
            .iter()
            .find(|c| c.goal == strong)
            .unwrap()
            .clone_id;
        let weak_clone = deliberation
            .promoted
            .iter()
            .find(|c| c.goal == weak)
            .unwrap()
            .clone_id;

        let report = processor.process_intentions().unwrap();
        assert_eq!(report.executed.len(), 1);
        assert_eq!(report.executed[0].goal, strong);
        assert_eq!(report.discarded.len(), 1);
        assert_eq!(report.discarded[0].goal, weak);
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let resolution = history
            .latest(HistoryFilter::new().from_id(conflict))
            .unwrap()
            .unwrap();
        assert_eq!(resolution.to_id, None);
        assert_eq!(resolution.value, json!({ "chosen": strong_clone, "removed": weak_clone }));
        assert!(history
            .query(&HistoryFilter::new().from_id(weak).to_id(plan))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn goal_without_eligible_plan_is_skipped_with_an_event() {
        let mut builder = ModelBuilder::new();
        let act = builder.action("act", |_ctx: &ActionContext<'_>| Ok(()));
        let plan = builder.plan(10, [act], "demanding").unwrap();
        let stage = builder.promotion("executive", "", fixed(1));
        let goal = builder.goal([stage], [plan], "g").unwrap();
        let agent = builder.agent(AgentSpec::new("a").goals([goal])).unwrap();
        let (processor, history) = processor_for(builder, agent);

        processor.deliberate(json!({})).unwrap();
        let report = processor.process_intentions().unwrap();
        assert!(report.executed.is_empty());
        assert_eq!(report.skipped.len(), 1);
        let skipped = history
            .latest(HistoryFilter::new().from_id(goal))
            .unwrap()
            .unwrap();
        assert_eq!(skipped.to_id, None);
        assert_eq!(skipped.payload_str("reason"), Some("no eligible plan"));
        assert!(history
            .query(&HistoryFilter::new().from_id(plan))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn failing_actions_are_recorded_and_isolated() {
        let mut builder = ModelBuilder::new();
        let broken = builder.action("broken", |_ctx: &ActionContext<'_>| {
            Err(anyhow!("gripper jammed"))
        });
        let panicking = builder.action("panicking", |_ctx: &ActionContext<'_>| -> anyhow::Result<()> {
            panic!("motor controller fault")
        });
        let fine = builder.action("fine", |ctx: &ActionContext<'_>| {
            anyhow::ensure!(ctx.env("battery") == json!(25), "unexpected environment");
            Ok(())
        });
        let plan = builder.plan(0, [broken, panicking, fine], "p").unwrap();
        let stage = builder.promotion("executive", "", fixed(1));
        let goal = builder.goal([stage], [plan], "g").unwrap();
        let agent = builder.agent(AgentSpec::new("a").goals([goal])).unwrap();
        let (processor, history) = processor_for(builder, agent);

        processor.deliberate(json!({ "battery": 25 })).unwrap();
        let report = processor.process_intentions().unwrap();
        assert_eq!(report.executed.len(), 1);
        assert_eq!(report.failed_actions, 2);

        let jammed = history
            .latest(HistoryFilter::new().to_id(broken))
            .unwrap()
            .unwrap();
        assert_eq!(jammed.from_id, plan);
        assert_eq!(jammed.payload_str("error"), Some("gripper jammed"));
        assert!(jammed.payload_str("stack").unwrap().contains("gripper jammed"));

        let panicked = history
            .latest(HistoryFilter::new().to_id(panicking))
            .unwrap()
            .unwrap();
        assert!(panicked
            .payload_str("error")
            .unwrap()
            .contains("motor controller fault"));

        let done = history
            .latest(HistoryFilter::new().to_id(fine))
            .unwrap()
            .unwrap();
        assert!(!done.is_failure());
        assert!(done.activation_time < done.time);
        assert!(done.time > jammed.time);
    }

    #[test]
    fn drain_empties_the_queue_and_orders_by_priority() {
        let mut builder = ModelBuilder::new();
        let act = builder.action("act", |_ctx: &ActionContext<'_>| Ok(()));
        let plan = builder.plan(0, [act], "p").unwrap();
        let first = builder.promotion("executive", "", fixed(1));
        let second = builder.promotion("executive", "", fixed(7));
        let low = builder.goal([first], [plan], "low").unwrap();
        let high = builder.goal([second], [plan], "high").unwrap();
        let agent = builder.agent(AgentSpec::new("a").goals([low, high])).unwrap();
        let (processor, history) = processor_for(builder, agent);

        processor.deliberate(json!({})).unwrap();
        let report = processor.process_intentions().unwrap();
        let order: Vec<_> = report.executed.iter().map(|c| c.goal).collect();
        assert_eq!(order, vec![high, low]);
        assert!(processor.intentions().is_empty());
        assert!(processor.process_intentions().unwrap().executed.is_empty());

        let selections = history
            .query(&HistoryFilter::new().to_id(plan))
            .unwrap();
        assert_eq!(selections.len(), 2);
        assert!(selections[0].time > Timestamp(0));
    }

    #[test]
    fn history_failure_requeues_unstarted_instances() {
        let mut builder = ModelBuilder::new();
        let act = builder.action("act", |_ctx: &ActionContext<'_>| Ok(()));
        let plan = builder.plan(0, [act], "p").unwrap();
        let mut goals = Vec::new();
        for priority in [9, 5, 1] {
            let stage = builder.promotion("executive", "", fixed(priority));
            goals.push(builder.goal([stage], [plan], format!("goal {priority}")).unwrap());
        }
        let agent = builder.agent(AgentSpec::new("a").goals(goals.clone())).unwrap();
        // Three promotions, then one selection and one action.
        let history = Arc::new(Exhausted {
            inner: InMemoryExecutionHistory::new(),
            budget: AtomicUsize::new(5),
        });
        let processor = SequentialProcessor::builder(builder.build(), agent)
            .history(history.clone())
            .clock(Arc::new(ManualClock::default()))
            .build()
            .unwrap();

        processor.deliberate(json!({})).unwrap();
        let err = processor.process_intentions().unwrap_err();
        assert!(matches!(err, EngineError::History(HistoryError::Rejected(_))));

        let pending: Vec<_> = processor
            .intentions()
            .snapshot()
            .iter()
            .map(|clone| clone.goal)
            .collect();
        assert_eq!(pending, vec![goals[1], goals[2]]);
        let selections = history
            .query(&HistoryFilter::new().to_id(plan))
            .unwrap();
        assert_eq!(selections.len(), 1);
        assert_eq!(selections[0].from_id, goals[0]);
    }
}

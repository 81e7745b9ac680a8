use serde_json::{json, Value};
use telos_logging::LogLevel;
use tracing::instrument;
use uuid::Uuid;

use super::{guarded, DeliberationReport, SequentialProcessor};
use crate::{
    container::RevisionContext, entity::EntityKind, error::EngineResult, model::GoalClone,
};

impl SequentialProcessor {
    /// Runs one deliberation cycle against the environment snapshot `env`.
    ///
    /// Belief revision rules run in agent order, then every goal template is
    /// cloned and promoted stage by stage. Clones that fired every stage are
    /// queued together once the cycle completes, so a concurrent drain sees
    /// either none or all of them.
    #[instrument(skip(self, env), fields(agent = %self.agent))]
    pub fn deliberate(&self, env: Value) -> EngineResult<DeliberationReport> {
        let _gate = self.deliberation_gate.lock();
        let cycle = Uuid::new_v4();
        let agent = self.registry.agent(self.agent)?;
        let recorder = self.recorder();
        self.env.replace(env);
        self.log(
            LogLevel::Debug,
            "deliberation.started",
            cycle,
            Some(self.agent),
            json!({ "brfs": agent.brfs.len(), "goals": agent.goals.len() }),
        );

        let mut report = DeliberationReport {
            cycle,
            revised: 0,
            promoted: Vec::new(),
            halted: 0,
            rule_failures: 0,
        };

        for &brf_id in &agent.brfs {
            let brf = self.registry.brf(brf_id)?;
            let ctx =
                RevisionContext::new(recorder, brf_id, &self.env, &agent.beliefs, &agent.channel);
            match guarded("belief revision", || brf.rule.revise(&ctx)) {
                Ok(()) => report.revised += 1,
                Err(err) => {
                    self.rule_failed(cycle, brf_id, EntityKind::BeliefReviewFunction, &err)?;
                    report.rule_failures += 1;
                }
            }
        }

        for &goal_id in &agent.goals {
            let goal = self.registry.goal(goal_id)?;
            let mut clone = GoalClone::of(goal);
            for &promotion_id in &goal.promotions {
                let promotion = self.registry.promotion(promotion_id)?;
                let beliefs = recorder.accessor(&agent.beliefs, promotion_id);
                let current = clone.priority;
                match guarded("promotion", || promotion.rule.promote(&beliefs, current)) {
                    Ok(Some(priority)) => {
                        clone.promote(promotion.stage(), priority);
                        recorder.record(
                            promotion_id,
                            Some(goal_id),
                            json!({ "incPriority": priority, "cloneId": clone.clone_id }),
                        )?;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        self.rule_failed(cycle, promotion_id, EntityKind::GoalPromotion, &err)?;
                        report.rule_failures += 1;
                        break;
                    }
                }
            }
            if clone.is_final(goal) {
                report.promoted.push(clone);
            } else {
                report.halted += 1;
            }
        }

        self.intentions.extend(report.promoted.iter().cloned());
        self.log(
            LogLevel::Info,
            "deliberation.finished",
            cycle,
            Some(self.agent),
            json!({
                "revised": report.revised,
                "promoted": report.promoted.len(),
                "halted": report.halted,
                "ruleFailures": report.rule_failures,
            }),
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use serde_json::json;
    use telos_logging::MemoryLogger;

    use super::*;
    use crate::{
        clock::ManualClock,
        config::RuleFailurePolicy,
        container::{Accessor, ActionContext},
        entity::EntityId,
        error::EngineError,
        history::{ExecutionHistory, HistoryFilter, InMemoryExecutionHistory},
        model::Priority,
        registry::{AgentSpec, ModelBuilder},
        telemetry::EngineTelemetry,
    };

    struct Rover {
        processor: SequentialProcessor,
        history: Arc<InMemoryExecutionHistory>,
        brf: EntityId,
        stage: EntityId,
        goal: EntityId,
    }

    fn rover(policy: RuleFailurePolicy, failing_brf: bool) -> Rover {
        let mut builder = ModelBuilder::new();
        let brf = builder.belief_revision("Analyze battery", move |ctx: &RevisionContext<'_>| {
            if failing_brf {
                anyhow::bail!("battery sensor offline");
            }
            let level = match ctx.env().number("battery")? {
                Some(battery) if battery < 30.0 => "low",
                Some(battery) if battery < 70.0 => "medium",
                _ => "high",
            };
            ctx.set("resources.battery", json!(level))?;
            Ok(())
        });
        let stage = builder.promotion(
            "executive",
            "Promote if battery low",
            |beliefs: &Accessor<'_>, priority: Priority| {
                Ok((beliefs.get("resources.battery")? == json!("low")).then_some(priority + 1))
            },
        );
        let action = builder.action("Recharge", |_ctx: &ActionContext<'_>| Ok(()));
        let plan = builder.plan(1, [action], "Go to base").unwrap();
        let goal = builder.goal([stage], [plan], "Recharge battery").unwrap();
        let agent = builder
            .agent(AgentSpec::new("rover").brfs([brf]).goals([goal]))
            .unwrap();
        let registry = builder.build();
        let history = Arc::new(InMemoryExecutionHistory::new());
        let processor = SequentialProcessor::builder(registry, agent)
            .history(history.clone())
            .clock(Arc::new(ManualClock::default()))
            .failure_policy(policy)
            .build()
            .unwrap();
        Rover {
            processor,
            history,
            brf,
            stage,
            goal,
        }
    }

    #[test]
    fn low_battery_promotes_and_queues_the_goal() {
        let rover = rover(RuleFailurePolicy::Propagate, false);
        let report = rover.processor.deliberate(json!({ "battery": 25 })).unwrap();
        assert_eq!(report.revised, 1);
        assert_eq!(report.promoted.len(), 1);
        assert_eq!(report.promoted[0].priority, 1);
        assert_eq!(report.promoted[0].status, vec!["executive"]);
        assert_eq!(rover.processor.intentions().len(), 1);

        let promotion = rover
            .history
            .latest(HistoryFilter::new().from_id(rover.stage))
            .unwrap()
            .unwrap();
        assert_eq!(promotion.to_id, Some(rover.goal));
        assert_eq!(promotion.value["incPriority"], json!(1));
        assert_eq!(
            promotion.value["cloneId"],
            json!(report.promoted[0].clone_id)
        );
    }

    #[test]
    fn unchanged_beliefs_are_not_rewritten() {
        let rover = rover(RuleFailurePolicy::Propagate, false);
        rover.processor.deliberate(json!({ "battery": 25 })).unwrap();
        rover.processor.deliberate(json!({ "battery": 20 })).unwrap();
        let writes = rover
            .history
            .query(&HistoryFilter::new().from_id(rover.brf))
            .unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(rover.processor.intentions().len(), 2);
    }

    #[test]
    fn healthy_battery_halts_the_chain() {
        let rover = rover(RuleFailurePolicy::Propagate, false);
        let report = rover.processor.deliberate(json!({ "battery": 90 })).unwrap();
        assert!(report.promoted.is_empty());
        assert_eq!(report.halted, 1);
        assert!(rover.processor.intentions().is_empty());
        assert!(rover
            .history
            .query(&HistoryFilter::new().from_id(rover.stage))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn propagate_policy_aborts_the_cycle() {
        let rover = rover(RuleFailurePolicy::Propagate, true);
        let err = rover.processor.deliberate(json!({ "battery": 25 })).unwrap_err();
        assert!(matches!(
            err,
            EngineError::RuleFailed { rule, kind: EntityKind::BeliefReviewFunction, .. } if rule == rover.brf
        ));
        assert!(rover.processor.intentions().is_empty());
    }

    #[test]
    fn record_policy_leaves_a_failure_event_and_continues() {
        let rover = rover(RuleFailurePolicy::Record, true);
        let report = rover.processor.deliberate(json!({ "battery": 25 })).unwrap();
        assert_eq!(report.rule_failures, 1);
        assert_eq!(report.halted, 1);
        let failure = rover
            .history
            .latest(HistoryFilter::new().from_id(rover.brf).to_ids([None]))
            .unwrap()
            .unwrap();
        assert_eq!(failure.payload_str("error"), Some("battery sensor offline"));
        assert!(failure.payload_str("stack").is_some());
    }

    #[test]
    fn panicking_rule_is_recorded_under_record_policy() {
        let mut builder = ModelBuilder::new();
        let brf = builder.belief_revision(
            "Read sensors",
            |_ctx: &RevisionContext<'_>| -> anyhow::Result<()> { panic!("sensor driver crashed") },
        );
        let agent = builder
            .agent(AgentSpec::new("rover").brfs([brf]))
            .unwrap();
        let history = Arc::new(InMemoryExecutionHistory::new());
        let processor = SequentialProcessor::builder(builder.build(), agent)
            .history(history.clone())
            .failure_policy(RuleFailurePolicy::Record)
            .build()
            .unwrap();

        let report = processor.deliberate(json!({})).unwrap();
        assert_eq!(report.revised, 0);
        assert_eq!(report.rule_failures, 1);
        let failure = history
            .latest(HistoryFilter::new().from_id(brf).to_ids([None]))
            .unwrap()
            .unwrap();
        assert!(failure
            .payload_str("error")
            .is_some_and(|error| error.contains("sensor driver crashed")));
        assert!(failure.payload_str("stack").is_some());
    }

    #[test]
    fn panicking_promotion_fails_the_cycle_under_propagate_policy() {
        let mut builder = ModelBuilder::new();
        let stage = builder.promotion(
            "executive",
            "",
            |_: &Accessor<'_>, _: Priority| -> anyhow::Result<Option<Priority>> {
                panic!("priority table corrupt")
            },
        );
        let action = builder.action("Idle", |_ctx: &ActionContext<'_>| Ok(()));
        let plan = builder.plan(0, [action], "idle").unwrap();
        let goal = builder.goal([stage], [plan], "idle").unwrap();
        let agent = builder.agent(AgentSpec::new("rover").goals([goal])).unwrap();
        let processor = SequentialProcessor::builder(builder.build(), agent)
            .build()
            .unwrap();

        let err = processor.deliberate(json!({})).unwrap_err();
        assert!(matches!(
            &err,
            EngineError::RuleFailed { rule, kind: EntityKind::GoalPromotion, message }
                if *rule == stage && message.contains("priority table corrupt")
        ));
        assert!(processor.intentions().is_empty());
    }

    #[test]
    fn promotion_chain_stops_at_the_first_silent_stage() {
        let mut builder = ModelBuilder::new();
        let active = builder.promotion("active", "", |_: &Accessor<'_>, p: Priority| {
            Ok(Some(p + 2))
        });
        let planning = builder.promotion("planning", "", |_: &Accessor<'_>, _: Priority| Ok(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executive = builder.promotion("executive", "", move |_: &Accessor<'_>, p: Priority| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Some(p))
        });
        let action = builder.action("Survey", |_ctx: &ActionContext<'_>| Ok(()));
        let plan = builder.plan(0, [action], "survey").unwrap();
        let goal = builder
            .goal([active, planning, executive], [plan], "Survey crater")
            .unwrap();
        let agent = builder.agent(AgentSpec::new("rover").goals([goal])).unwrap();
        let history = Arc::new(InMemoryExecutionHistory::new());
        let processor = SequentialProcessor::builder(builder.build(), agent)
            .history(history.clone())
            .build()
            .unwrap();

        let report = processor.deliberate(json!({})).unwrap();
        assert_eq!(report.halted, 1);
        assert!(report.promoted.is_empty());
        assert!(processor.intentions().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let first = history
            .latest(HistoryFilter::new().from_id(active).to_id(goal))
            .unwrap()
            .unwrap();
        assert_eq!(first.value["incPriority"], json!(2));
        assert!(first.value["cloneId"].is_string());
        for silent in [planning, executive] {
            assert!(history
                .query(&HistoryFilter::new().from_id(silent))
                .unwrap()
                .is_empty());
        }
    }

    #[test]
    fn telemetry_receives_cycle_records() {
        let mut builder = ModelBuilder::new();
        let agent = builder.agent(AgentSpec::new("idle")).unwrap();
        let memory = Arc::new(MemoryLogger::new(16));
        let telemetry = EngineTelemetry::builder("telos")
            .sink(memory.clone())
            .build()
            .unwrap();
        let processor = SequentialProcessor::builder(builder.build(), agent)
            .telemetry(telemetry)
            .build()
            .unwrap();
        let report = processor.deliberate(json!({})).unwrap();
        let finished = memory.find("deliberation.finished");
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].cycle, Some(report.cycle));
    }

    #[test]
    fn unknown_agent_is_rejected_at_build_time() {
        let registry = ModelBuilder::new().build();
        assert!(SequentialProcessor::builder(registry, EntityId::generate())
            .build()
            .is_err());
    }
}

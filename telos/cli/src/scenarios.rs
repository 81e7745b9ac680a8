//! Built-in agents used by `telos demo` and `telos query`.

use std::sync::Arc;

use anyhow::Result;
use clap::ValueEnum;
use serde_json::{json, Value};
use telos_engine::{
    Accessor, ActionContext, AgentSpec, EntityId, ModelBuilder, Priority, Registry,
    RevisionContext,
};
use tracing::info;

/// Selectable demo scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScenarioKind {
    /// Rover rescuing accident victims while watching its battery.
    Rescue,
    /// Rover returning to base when the battery runs low.
    Base,
    /// Rescue and recharge competing for the same rover.
    Conflict,
}

/// A registry plus the ids the CLI reports on.
pub struct Scenario {
    pub registry: Arc<Registry>,
    pub agent: EntityId,
    pub env: Value,
    /// Action whose latest completion gets explained.
    pub focus: EntityId,
    /// Plan and action the counterfactual asks about.
    pub alternative: (EntityId, EntityId),
}

impl ScenarioKind {
    pub fn build(self) -> Result<Scenario> {
        match self {
            Self::Rescue => rescue(),
            Self::Base => base(),
            Self::Conflict => conflict(),
        }
    }
}

struct Rover {
    builder: ModelBuilder,
    brf_accident: EntityId,
    brf_battery: EntityId,
    rescue_goal: EntityId,
    rescue_plan: EntityId,
    rescue_action: EntityId,
    base_goal: EntityId,
    base_plan: EntityId,
    base_action: EntityId,
}

fn analyze_accident(ctx: &RevisionContext<'_>) -> Result<()> {
    let accident = match ctx.env().get("accidents")? {
        Value::Array(accidents) => accidents.last().cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    };
    ctx.set("accident", accident)?;
    Ok(())
}

fn analyze_battery(ctx: &RevisionContext<'_>) -> Result<()> {
    let level = match ctx.env().number("battery")? {
        Some(battery) if battery < 30.0 => "low",
        Some(battery) if battery < 70.0 => "medium",
        _ => "high",
    };
    ctx.set("resources.battery", json!(level))?;
    Ok(())
}

fn rover(base_margin: Priority) -> Result<Rover> {
    let mut builder = ModelBuilder::new();
    let brf_accident = builder.belief_revision("Analyze accident", analyze_accident);
    let brf_battery = builder.belief_revision("Analyze battery", analyze_battery);

    let rescue_active = builder.promotion(
        "active",
        "Activate when an accident is reported",
        |beliefs: &Accessor<'_>, priority: Priority| {
            if beliefs.get("accident")?.is_null() {
                return Ok(None);
            }
            let high = beliefs.get("accident.risk")? == json!("high");
            Ok(Some(if high { priority + 1 } else { priority }))
        },
    );
    let rescue_executive = builder.promotion(
        "executive",
        "Execute unless the battery is low",
        |beliefs: &Accessor<'_>, priority: Priority| {
            Ok((beliefs.get("resources.battery")? != json!("low")).then_some(priority))
        },
    );
    let rescue_action = builder.action("Rescue victims", |ctx: &ActionContext<'_>| {
        info!(accident = %ctx.belief("accident"), "rescuing");
        Ok(())
    });
    let rescue_plan = builder.plan(0, [rescue_action], "Fly to the accident")?;
    let rescue_goal = builder.goal([rescue_active, rescue_executive], [rescue_plan], "Rescue")?;

    let base_executive = builder.promotion(
        "executive",
        "Return when the battery is not high",
        move |beliefs: &Accessor<'_>, priority: Priority| {
            let level = beliefs.get("resources.battery")?;
            Ok(match level.as_str() {
                Some("low") => Some(priority + base_margin + 1),
                Some("medium") if base_margin > 0 => Some(priority + base_margin),
                _ => None,
            })
        },
    );
    let base_action = builder.action("Recharge", |ctx: &ActionContext<'_>| {
        info!(battery = %ctx.env("battery"), "docking");
        Ok(())
    });
    let base_plan = builder.plan(1, [base_action], "Go to base")?;
    let base_goal = builder.goal([base_executive], [base_plan], "Recharge battery")?;

    Ok(Rover {
        builder,
        brf_accident,
        brf_battery,
        rescue_goal,
        rescue_plan,
        rescue_action,
        base_goal,
        base_plan,
        base_action,
    })
}

fn rescue() -> Result<Scenario> {
    let mut rover = rover(0)?;
    let agent = rover.builder.agent(
        AgentSpec::new("Rescue rover")
            .brfs([rover.brf_accident, rover.brf_battery])
            .goals([rover.rescue_goal, rover.base_goal]),
    )?;
    Ok(Scenario {
        registry: rover.builder.build(),
        agent,
        env: json!({
            "accidents": [
                { "coordinates": [15, 30], "risk": "medium" },
                { "coordinates": [20, 40], "risk": "high" },
            ],
            "battery": 60,
        }),
        focus: rover.rescue_action,
        alternative: (rover.base_plan, rover.base_action),
    })
}

fn base() -> Result<Scenario> {
    let mut rover = rover(0)?;
    let agent = rover.builder.agent(
        AgentSpec::new("Base rover")
            .brfs([rover.brf_battery])
            .goals([rover.base_goal]),
    )?;
    Ok(Scenario {
        registry: rover.builder.build(),
        agent,
        env: json!({ "battery": 25 }),
        focus: rover.base_action,
        alternative: (rover.rescue_plan, rover.rescue_action),
    })
}

fn conflict() -> Result<Scenario> {
    let mut rover = rover(1)?;
    let conflict = rover
        .builder
        .conflict([rover.base_goal, rover.rescue_goal], "One rover, one destination")?;
    let agent = rover.builder.agent(
        AgentSpec::new("Contended rover")
            .brfs([rover.brf_accident, rover.brf_battery])
            .goals([rover.rescue_goal, rover.base_goal])
            .conflicts([conflict]),
    )?;
    Ok(Scenario {
        registry: rover.builder.build(),
        agent,
        env: json!({
            "accidents": [{ "coordinates": [20, 40], "risk": "high" }],
            "battery": 50,
        }),
        focus: rover.rescue_action,
        alternative: (rover.base_plan, rover.base_action),
    })
}

#[cfg(test)]
mod tests {
    use telos_engine::SequentialProcessor;

    use super::*;

    fn run(kind: ScenarioKind) -> (Scenario, telos_engine::DrainReport) {
        let scenario = kind.build().unwrap();
        let processor =
            SequentialProcessor::builder(scenario.registry.clone(), scenario.agent)
                .build()
                .unwrap();
        processor.deliberate(scenario.env.clone()).unwrap();
        let drain = processor.process_intentions().unwrap();
        (scenario, drain)
    }

    #[test]
    fn rescue_runs_the_rescue_plan() {
        let (scenario, drain) = run(ScenarioKind::Rescue);
        assert_eq!(drain.executed.len(), 1);
        let goal = scenario.registry.goal(drain.executed[0].goal).unwrap();
        assert_eq!(goal.meta.desc, "Rescue");
        assert_eq!(drain.executed[0].priority, 1);
    }

    #[test]
    fn base_runs_the_recharge_plan() {
        let (_, drain) = run(ScenarioKind::Base);
        assert_eq!(drain.executed.len(), 1);
        assert_eq!(drain.executed[0].priority, 1);
    }

    #[test]
    fn conflict_keeps_one_goal() {
        let (scenario, drain) = run(ScenarioKind::Conflict);
        assert_eq!(drain.executed.len(), 1);
        assert_eq!(drain.discarded.len(), 1);
        let winner = scenario.registry.goal(drain.executed[0].goal).unwrap();
        assert_eq!(winner.meta.desc, "Rescue");
    }
}

mod scenarios;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use telos_engine::{
    AgentRuntime, CausalModel, EngineConfig, EngineTelemetry, ExecutionHistory, Explainer,
    HistoryFilter, Registry, SequentialProcessor, State, Timestamp,
};
use telos_logging::{LogRecord, LogSink, MemoryLogger};
use tokio::runtime::Runtime;

use crate::scenarios::{Scenario, ScenarioKind};

#[derive(Parser, Debug)]
#[command(name = "telos", version, about = "Goal-directed agent reasoning demos")]
struct Cli {
    /// Engine configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Prints JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    /// Prints the last N telemetry records after the run.
    #[arg(long, global = true, default_value_t = 0)]
    log_tail: usize,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs a scenario and explains its latest action.
    Demo {
        scenario: ScenarioKind,
        /// Synchronous deliberation + intention cycles.
        #[arg(long, default_value_t = 1)]
        cycles: usize,
        /// Drives the scenario with the periodic runtime for this long instead.
        #[arg(long)]
        run_for_ms: Option<u64>,
    },
    /// Runs a scenario and prints events matching a filter.
    Query {
        scenario: ScenarioKind,
        /// Filter such as `{"limit": 3, "order": "asc"}`.
        #[arg(long, default_value = "{}")]
        filter: String,
        #[arg(long, default_value_t = 1)]
        cycles: usize,
    },
    /// Prints the effective configuration.
    Config,
}

struct Session {
    scenario: Scenario,
    processor: Arc<SequentialProcessor>,
    explainer: Explainer,
    memory: Arc<MemoryLogger>,
}

impl Session {
    fn open(kind: ScenarioKind, config: &EngineConfig) -> Result<Self> {
        let scenario = kind.build()?;
        let memory = Arc::new(MemoryLogger::new(256));
        let telemetry = EngineTelemetry::from_settings(
            &config.telemetry,
            [memory.clone() as Arc<dyn LogSink>],
        )?;
        let processor = SequentialProcessor::builder(scenario.registry.clone(), scenario.agent)
            .config(config)
            .telemetry(telemetry)
            .build()?;
        let processor = Arc::new(processor);
        let model: Arc<dyn CausalModel> = scenario.registry.clone();
        let explainer =
            Explainer::new(processor.history().clone(), model).with_settings(&config.explainer);
        Ok(Self {
            scenario,
            processor,
            explainer,
            memory,
        })
    }

    fn run_cycles(&self, cycles: usize) -> Result<()> {
        for _ in 0..cycles {
            self.processor.deliberate(self.scenario.env.clone())?;
            self.processor.process_intentions()?;
        }
        Ok(())
    }

    fn run_for(&self, config: &EngineConfig, duration: Duration) -> Result<()> {
        let runtime = Runtime::new().context("failed to start tokio runtime")?;
        runtime.block_on(async {
            let agent = AgentRuntime::new(self.processor.clone(), config);
            agent.start(Arc::new(self.scenario.env.clone()))?;
            tokio::time::sleep(duration).await;
            agent.stop().await?;
            tracing::info!(stats = ?agent.stats(), "runtime finished");
            Ok::<_, anyhow::Error>(())
        })
    }

    fn history(&self) -> &Arc<dyn ExecutionHistory> {
        self.processor.history()
    }

    fn tail(&self, count: usize) -> Vec<LogRecord> {
        let records = self.memory.snapshot();
        let skip = records.len().saturating_sub(count);
        records.into_iter().skip(skip).collect()
    }
}

#[derive(Serialize)]
struct CauseLine<'a> {
    depth: usize,
    describe: String,
    event: &'a State,
}

#[derive(Serialize)]
struct CounterfactualLine<'a> {
    depth: usize,
    score: f64,
    describe: String,
    event: &'a State,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Demo {
            scenario,
            cycles,
            run_for_ms,
        } => {
            let session = Session::open(scenario, &config)?;
            match run_for_ms {
                Some(ms) => session.run_for(&config, Duration::from_millis(ms))?,
                None => session.run_cycles(cycles)?,
            }
            handle_demo(&session, cli.json)?;
            print_tail(&session, cli.log_tail, cli.json)?;
        }
        Commands::Query {
            scenario,
            filter,
            cycles,
        } => {
            let raw: Value = serde_json::from_str(&filter).context("filter is not valid JSON")?;
            let filter = HistoryFilter::from_json(raw)?;
            let session = Session::open(scenario, &config)?;
            session.run_cycles(cycles)?;
            let events = session.history().query(&filter)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                for event in &events {
                    println!("{}", render(&session.scenario.registry, event));
                }
                println!("{} event(s)", events.len());
            }
            print_tail(&session, cli.log_tail, cli.json)?;
        }
        Commands::Config => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", config.to_toml()?);
            }
        }
    }
    Ok(())
}

fn handle_demo(session: &Session, as_json: bool) -> Result<()> {
    let registry = &session.scenario.registry;
    let Some(last) = session
        .history()
        .latest(HistoryFilter::new().to_id(session.scenario.focus))?
    else {
        println!(
            "no completed event for {}",
            registry.describe(session.scenario.focus)
        );
        return Ok(());
    };

    let causes = session
        .explainer
        .x_history(&last)
        .collect::<Result<Vec<_>, _>>()?;

    let (plan, action) = session.scenario.alternative;
    let at = session
        .history()
        .latest(HistoryFilter::new())?
        .map_or(Timestamp(0), |newest| newest.time + 1);
    let hypothetical = State::hypothetical(plan, Some(action), at);
    let missing = session
        .explainer
        .x_not(&hypothetical)
        .collect::<Result<Vec<_>, _>>()?;

    if as_json {
        let report = json!({
            "context": run_context(session),
            "event": last,
            "xHistory": causes
                .iter()
                .map(|(event, depth)| CauseLine {
                    depth: *depth,
                    describe: render(registry, event),
                    event,
                })
                .collect::<Vec<_>>(),
            "xNot": missing
                .iter()
                .map(|(event, score, depth)| CounterfactualLine {
                    depth: *depth,
                    score: *score,
                    describe: render(registry, event),
                    event,
                })
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "policy {:?}, {} agent(s) declared",
        session.processor.failure_policy(),
        registry.agents().count()
    );
    println!("0: {}", render(registry, &last));
    for (event, depth) in &causes {
        println!("{depth}: {}", render(registry, event));
    }
    println!("--- xNot ---");
    for (event, score, depth) in &missing {
        println!("{depth}: Score: {score:.3}. {}", render(registry, event));
    }
    Ok(())
}

/// Agents, rule failure policy and environment the run saw.
fn run_context(session: &Session) -> Value {
    let processor = &session.processor;
    let agents: Vec<Value> = session
        .scenario
        .registry
        .agents()
        .map(|agent| {
            json!({
                "id": agent.meta.id,
                "desc": agent.meta.desc,
                "driven": agent.meta.id == processor.agent(),
                "goals": agent.goals.len(),
                "beliefs": agent.beliefs.snapshot(),
            })
        })
        .collect();
    json!({
        "agents": agents,
        "failurePolicy": processor.failure_policy(),
        "environment": processor.environment().snapshot(),
    })
}

fn print_tail(session: &Session, count: usize, as_json: bool) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let records = session.tail(count);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    println!("--- log ---");
    for record in records {
        println!(
            "{} {:?} {} {:?}",
            record.timestamp.format("%H:%M:%S%.3f"),
            record.level,
            record.message,
            record.metadata
        );
    }
    Ok(())
}

/// `from -> to [activation..time] summary`
fn render(registry: &Registry, event: &State) -> String {
    let to = event
        .to_id
        .map_or_else(|| "nothing".to_string(), |id| registry.describe(id));
    format!(
        "{} -> {} [{}..{}] {}",
        registry.describe(event.from_id),
        to,
        event.activation_time.0,
        event.time.0,
        summarize(&event.value)
    )
}

fn summarize(value: &Value) -> String {
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return format!("error: {error}");
    }
    if let Some(increment) = value.get("incPriority") {
        return format!("priority -> {increment}");
    }
    if let Some(removed) = value.get("removed") {
        return format!("removed {removed}");
    }
    if let Some(reason) = value.get("reason").and_then(Value::as_str) {
        return reason.to_string();
    }
    if let Some(priority) = value.get("priority") {
        return format!("priority {priority}");
    }
    match value {
        Value::Null => String::new(),
        Value::Object(map) if map.is_empty() => String::new(),
        other => other.to_string(),
    }
}

//! Periodic deliberation and intention loops on a tokio runtime.
//!
//! Cycles themselves are synchronous and run on the blocking pool. The
//! processor serializes deliberations among themselves and drains among
//! themselves, and the intention queue hands clones from one loop to the
//! other.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use telos_logging::LogLevel;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    config::{EngineConfig, RuntimeMode, RuntimeSettings},
    error::{EngineError, EngineResult},
    processor::SequentialProcessor,
    telemetry::EngineTelemetry,
};

/// Supplies the environment snapshot for each deliberation tick.
pub trait EnvironmentSource: Send + Sync {
    /// Current environment.
    fn snapshot(&self) -> Value;
}

impl EnvironmentSource for Value {
    fn snapshot(&self) -> Value {
        self.clone()
    }
}

/// Environment produced by a closure on every tick.
pub struct FnEnvironment<F>(pub F);

impl<F> EnvironmentSource for FnEnvironment<F>
where
    F: Fn() -> Value + Send + Sync,
{
    fn snapshot(&self) -> Value {
        (self.0)()
    }
}

/// Counters describing what the loops did so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    /// Completed deliberation cycles.
    pub deliberations: u64,
    /// Completed intention drains.
    pub drains: u64,
    /// Deliberation ticks skipped because the queue was saturated.
    pub skipped_ticks: u64,
    /// Cycles that returned an error.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    deliberations: AtomicU64,
    drains: AtomicU64,
    skipped_ticks: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RuntimeStats {
        RuntimeStats {
            deliberations: self.deliberations.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the loop tasks.
#[derive(Clone)]
struct LoopContext {
    processor: Arc<SequentialProcessor>,
    telemetry: Option<EngineTelemetry>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl LoopContext {
    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.log(level, message, metadata) {
                warn!(error = %err, "telemetry sink failed");
            }
        }
    }

    fn failed(&self, activity: &str, err: &EngineError) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!(activity, error = %err, "cycle failed");
        self.log(
            LogLevel::Error,
            "runtime.cycle_failed",
            json!({ "activity": activity, "error": err.to_string() }),
        );
    }

    async fn deliberation_tick(&self, env: &Arc<dyn EnvironmentSource>) {
        let queue = self.processor.intentions();
        if queue.is_saturated(self.capacity) {
            let queued = queue.len();
            self.counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            debug!(queued, capacity = self.capacity, "deliberation tick skipped");
            self.log(
                LogLevel::Warn,
                "runtime.tick_skipped",
                json!({ "queued": queued, "capacity": self.capacity }),
            );
            return;
        }
        let processor = Arc::clone(&self.processor);
        let snapshot = env.snapshot();
        match tokio::task::spawn_blocking(move || processor.deliberate(snapshot)).await {
            Ok(Ok(_)) => {
                self.counters.deliberations.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => self.failed("deliberation", &err),
            Err(err) => self.failed("deliberation", &EngineError::Runtime(err.to_string())),
        }
    }

    async fn intention_tick(&self) {
        let processor = Arc::clone(&self.processor);
        match tokio::task::spawn_blocking(move || processor.process_intentions()).await {
            Ok(Ok(_)) => {
                self.counters.drains.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => self.failed("intentions", &err),
            Err(err) => self.failed("intentions", &EngineError::Runtime(err.to_string())),
        }
    }
}

/// Drives a [`SequentialProcessor`] periodically until stopped.
pub struct AgentRuntime {
    context: LoopContext,
    settings: RuntimeSettings,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl AgentRuntime {
    /// Creates a stopped runtime using the `[runtime]` and `[intentions]` sections.
    #[must_use]
    pub fn new(processor: Arc<SequentialProcessor>, config: &EngineConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            context: LoopContext {
                processor,
                telemetry: None,
                counters: Arc::new(Counters::default()),
                capacity: config.intentions.capacity.max(1),
            },
            settings: config.runtime.clone(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EngineTelemetry) -> Self {
        self.context.telemetry = Some(telemetry);
        self
    }

    /// Processor being driven.
    #[must_use]
    pub fn processor(&self) -> &Arc<SequentialProcessor> {
        &self.context.processor
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        self.context.counters.snapshot()
    }

    /// Whether loop tasks are active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Spawns the loops on the current tokio runtime.
    pub fn start(&self, env: Arc<dyn EnvironmentSource>) -> EngineResult<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Err(EngineError::Runtime("runtime already started".into()));
        }
        if self.settings.deliberation_interval_ms == 0 || self.settings.intention_interval_ms == 0 {
            return Err(EngineError::Config("runtime intervals must be positive".into()));
        }
        self.shutdown.send_replace(false);
        match self.settings.mode {
            RuntimeMode::Cooperative => {
                let context = self.context.clone();
                let mut shutdown = self.shutdown.subscribe();
                let mut ticker = interval(self.settings.deliberation_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                context.deliberation_tick(&env).await;
                                context.intention_tick().await;
                            }
                            _ = shutdown.changed() => break,
                        }
                    }
                }));
            }
            RuntimeMode::Concurrent => {
                let context = self.context.clone();
                let mut shutdown = self.shutdown.subscribe();
                let mut ticker = interval(self.settings.deliberation_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => context.deliberation_tick(&env).await,
                            _ = shutdown.changed() => break,
                        }
                    }
                }));

                let context = self.context.clone();
                let mut shutdown = self.shutdown.subscribe();
                let mut ticker = interval(self.settings.intention_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => context.intention_tick().await,
                            _ = shutdown.changed() => break,
                        }
                    }
                }));
            }
        }
        self.context.log(
            LogLevel::Info,
            "runtime.started",
            json!({
                "mode": self.settings.mode,
                "deliberationIntervalMs": self.settings.deliberation_interval_ms,
                "intentionIntervalMs": self.settings.intention_interval_ms,
            }),
        );
        Ok(())
    }

    /// Signals the loops to stop and waits for in-flight cycles to finish.
    /// Calling it again, or on a runtime that never started, is a no-op.
    pub async fn stop(&self) -> EngineResult<()> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return Ok(());
        }
        self.shutdown.send_replace(true);
        let mut failure = None;
        for task in tasks {
            if let Err(err) = task.await {
                failure = Some(EngineError::Runtime(err.to_string()));
            }
        }
        self.context.log(
            LogLevel::Info,
            "runtime.stopped",
            serde_json::to_value(self.stats()).unwrap_or(Value::Null),
        );
        failure.map_or(Ok(()), Err)
    }
}

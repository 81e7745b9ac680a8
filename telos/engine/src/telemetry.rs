use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use telos_logging::{JsonLogger, LogLevel, LogRecord, LogSink};
use tracing::{debug, error, info, warn};

use crate::config::TelemetrySettings;

/// Builder for engine telemetry sinks.
pub struct EngineTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    sinks: Vec<Arc<dyn LogSink>>,
}

impl EngineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            sinks: Vec::new(),
        }
    }

    /// Writes JSON lines to `path`.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Adds another sink, e.g. a [`telos_logging::MemoryLogger`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<EngineTelemetry> {
        let mut sinks = self.sinks;
        if let Some(path) = self.log_path {
            sinks.insert(0, Arc::new(JsonLogger::new(path)?));
        }
        Ok(EngineTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                sinks,
            }),
        })
    }
}

/// Telemetry handle shared by the processor and the runtime.
///
/// Every record is mirrored to `tracing` and then written to each sink.
#[derive(Clone)]
pub struct EngineTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for EngineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineTelemetry")
            .field("module", &self.inner.module)
            .field("sinks", &self.inner.sinks.len())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    sinks: Vec<Arc<dyn LogSink>>,
}

impl EngineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> EngineTelemetryBuilder {
        EngineTelemetryBuilder::new(module)
    }

    /// Builds telemetry from the `[telemetry]` section plus extra sinks.
    pub fn from_settings(
        settings: &TelemetrySettings,
        extra: impl IntoIterator<Item = Arc<dyn LogSink>>,
    ) -> Result<Self> {
        let mut builder = Self::builder(settings.module.clone());
        if let Some(path) = &settings.log_path {
            builder = builder.log_path(path);
        }
        for sink in extra {
            builder = builder.sink(sink);
        }
        builder.build()
    }

    /// Module name stamped on records.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Starts a record for this module.
    #[must_use]
    pub fn record(&self, level: LogLevel, message: &str) -> LogRecord {
        LogRecord::new(&self.inner.module, level, message)
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        self.emit(&self.record(level, message).with_metadata(metadata))
    }

    /// Writes a prepared record to every sink.
    pub fn emit(&self, record: &LogRecord) -> Result<()> {
        let metadata = Value::Object(record.metadata.clone());
        match record.level {
            LogLevel::Debug => debug!(module = %record.module, %metadata, "{}", record.message),
            LogLevel::Info => info!(module = %record.module, %metadata, "{}", record.message),
            LogLevel::Warn => warn!(module = %record.module, %metadata, "{}", record.message),
            LogLevel::Error => error!(module = %record.module, %metadata, "{}", record.message),
        }
        for sink in &self.inner.sinks {
            sink.write(record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use telos_logging::MemoryLogger;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[test]
    fn telemetry_writes_file_and_extra_sink() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("engine.log");
        let memory = Arc::new(MemoryLogger::new(8));
        let telemetry = EngineTelemetry::builder("telos")
            .log_path(&path)
            .sink(memory.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "deliberation.finished", json!({ "promoted": 2 }))
            .unwrap();
        let cycle = Uuid::new_v4();
        telemetry
            .emit(
                &telemetry
                    .record(LogLevel::Warn, "intentions.action_failed")
                    .with_cycle(cycle),
            )
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("deliberation.finished"));
        assert_eq!(content.lines().count(), 2);
        let failed = memory.find("intentions.action_failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].cycle, Some(cycle));
    }

    #[test]
    fn settings_without_path_only_use_extra_sinks() {
        let memory = Arc::new(MemoryLogger::new(4));
        let sink: Arc<dyn LogSink> = memory.clone();
        let telemetry =
            EngineTelemetry::from_settings(&TelemetrySettings::default(), [sink]).unwrap();
        assert_eq!(telemetry.module(), "telos");
        telemetry.log(LogLevel::Debug, "settings.check", Value::Null).unwrap();
        assert_eq!(memory.snapshot().len(), 1);
    }
}

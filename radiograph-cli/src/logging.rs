//! Structured logging for the CLI runner.

use crate::config::{LogFormat, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use color_eyre::eyre::Result;
use radiograph_core::logging::{LogEntry as EngineLogEntry, LogLevel as EngineLogLevel};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};

/// Structured log event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    /// A graph was flattened, validated, and planned.
    GraphLoaded { nodes: usize, edges: usize },

    /// The scheduler transitioned lifecycle state.
    StateChange { state: String },

    /// One entry forwarded from the engine's own `SignalLogger`.
    EngineLog(EngineLogRecord),

    /// End-of-run summary.
    Summary(SummaryEvent),

    /// General info message
    Info { message: String },

    /// Warning message
    Warn { message: String },

    /// Error message
    Error { message: String, details: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineLogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub subsystem: String,
    pub message: String,
}

impl EngineLogRecord {
    pub fn from_entry(entry: &EngineLogEntry) -> Self {
        let level = match entry.level {
            EngineLogLevel::Trace => "trace",
            EngineLogLevel::Debug => "debug",
            EngineLogLevel::Info => "info",
            EngineLogLevel::Warn => "warn",
            EngineLogLevel::Error => "error",
        };
        Self {
            timestamp: Utc::now(),
            level: level.to_string(),
            subsystem: entry.subsystem.to_string(),
            message: entry.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryEvent {
    pub timestamp: DateTime<Utc>,
    pub duration_secs: f64,
    pub final_state: String,
    pub error: Option<String>,
}

/// Logger that outputs structured logs
pub struct StructuredLogger {
    config: LoggingConfig,
    writer: Box<dyn Write + Send>,
    start_time: DateTime<Utc>,
}

impl StructuredLogger {
    pub fn new(config: LoggingConfig) -> Result<Self> {
        let writer: Box<dyn Write + Send> = match &config.target {
            LogTarget::Stdout => Box::new(io::stdout()),
            LogTarget::Stderr => Box::new(io::stderr()),
            LogTarget::File => {
                let path = config.file_path.as_ref()
                    .ok_or_else(|| color_eyre::eyre::eyre!("File path required for file logging"))?;
                Box::new(BufWriter::new(File::create(path)?))
            }
        };

        Ok(Self {
            config,
            writer,
            start_time: Utc::now(),
        })
    }

    pub fn log(&mut self, event: LogEvent) -> Result<()> {
        let output = match self.config.format {
            LogFormat::Json => self.format_json(&event)?,
            LogFormat::Logfmt => self.format_logfmt(&event)?,
            LogFormat::Pretty => self.format_pretty(&event)?,
        };

        writeln!(self.writer, "{}", output)?;
        self.writer.flush()?;

        Ok(())
    }

    fn format_json(&self, event: &LogEvent) -> Result<String> {
        Ok(serde_json::to_string(event)?)
    }

    fn format_logfmt(&self, event: &LogEvent) -> Result<String> {
        let ts = Utc::now().to_rfc3339();

        let msg = match event {
            LogEvent::GraphLoaded { nodes, edges } => {
                format!("ts=\"{}\" type=graph_loaded nodes={} edges={}", ts, nodes, edges)
            }
            LogEvent::StateChange { state } => {
                format!("ts=\"{}\" type=state_change state={}", ts, state)
            }
            LogEvent::EngineLog(e) => {
                format!(
                    "ts=\"{}\" type=engine_log level={} subsystem={} msg=\"{}\"",
                    ts, e.level, e.subsystem, e.message
                )
            }
            LogEvent::Summary(s) => {
                format!(
                    "ts=\"{}\" type=summary duration_secs={:.3} final_state={} error={}",
                    ts,
                    s.duration_secs,
                    s.final_state,
                    s.error.as_deref().unwrap_or("none")
                )
            }
            LogEvent::Info { message } => format!("ts=\"{}\" level=info msg=\"{}\"", ts, message),
            LogEvent::Warn { message } => format!("ts=\"{}\" level=warn msg=\"{}\"", ts, message),
            LogEvent::Error { message, details } => {
                if let Some(d) = details {
                    format!("ts=\"{}\" level=error msg=\"{}\" details=\"{}\"", ts, message, d)
                } else {
                    format!("ts=\"{}\" level=error msg=\"{}\"", ts, message)
                }
            }
        };

        Ok(msg)
    }

    fn format_pretty(&self, event: &LogEvent) -> Result<String> {
        let ts = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");

        let msg = match event {
            LogEvent::GraphLoaded { nodes, edges } => {
                format!("[{}] GRAPH LOADED: {} nodes, {} edges", ts, nodes, edges)
            }
            LogEvent::StateChange { state } => format!("[{}] STATE -> {}", ts, state),
            LogEvent::EngineLog(e) => {
                format!("[{}] {} {}: {}", ts, e.level.to_uppercase(), e.subsystem, e.message)
            }
            LogEvent::Summary(s) => {
                format!(
                    "[{}] SUMMARY ({:.3}s): final_state={}{}",
                    ts,
                    s.duration_secs,
                    s.final_state,
                    s.error.as_ref().map(|e| format!(" error={}", e)).unwrap_or_default()
                )
            }
            LogEvent::Info { message } => format!("[{}] INFO: {}", ts, message),
            LogEvent::Warn { message } => format!("[{}] WARN: {}", ts, message),
            LogEvent::Error { message, details } => {
                if let Some(d) = details {
                    format!("[{}] ERROR: {} | {}", ts, message, d)
                } else {
                    format!("[{}] ERROR: {}", ts, message)
                }
            }
        };

        Ok(msg)
    }

    pub fn elapsed(&self) -> f64 {
        (Utc::now() - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}

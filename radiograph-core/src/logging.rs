//! Structured logging for the flow-graph engine.
//!
//! Generalized from the teacher's bespoke `&mut self` `SignalLogger` into a
//! shared `Arc<SignalLogger>` with an internal `Mutex<Vec<LogEntry>>`, since
//! every scheduler worker thread now needs to log concurrently. The
//! filtering/level/subsystem-toggle mechanics are otherwise unchanged; no
//! `log`/`tracing` crate is introduced because the teacher never used one.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Log level for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Logging configuration. Subsystem names match the engine's own
/// components rather than the teacher's DSP subsystems: `SCHED` (the
/// scheduler/worker loop), `PIPE` (pipe I/O), `INFER` (type/rate
/// inference), `CTRL` (the control plane).
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub enable_sched: bool,
    pub enable_pipe: bool,
    pub enable_infer: bool,
    pub enable_ctrl: bool,
    pub max_entries: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            enable_sched: true,
            enable_pipe: true,
            enable_infer: true,
            enable_ctrl: true,
            max_entries: 1000,
        }
    }
}

impl LogConfig {
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            max_entries: 5000,
            ..Self::default()
        }
    }

    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Warn,
            enable_sched: false,
            enable_pipe: false,
            enable_infer: false,
            enable_ctrl: true,
            max_entries: 100,
        }
    }

    pub fn disabled() -> Self {
        Self {
            level: LogLevel::Error,
            enable_sched: false,
            enable_pipe: false,
            enable_infer: false,
            enable_ctrl: false,
            max_entries: 0,
        }
    }
}

/// A single log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub subsystem: &'static str,
    pub message: String,
}

/// Logger that collects structured log entries, shared across worker
/// threads behind an `Arc`.
#[derive(Debug)]
pub struct SignalLogger {
    config: LogConfig,
    entries: Mutex<Vec<LogEntry>>,
}

impl SignalLogger {
    pub fn new(config: LogConfig) -> Arc<Self> {
        let capacity = config.max_entries.min(1000);
        Arc::new(Self {
            config,
            entries: Mutex::new(Vec::with_capacity(capacity)),
        })
    }

    pub fn log(&self, level: LogLevel, subsystem: &'static str, message: impl fmt::Display) {
        if level < self.config.level {
            return;
        }

        let enabled = match subsystem {
            "SCHED" => self.config.enable_sched,
            "PIPE" => self.config.enable_pipe,
            "INFER" => self.config.enable_infer,
            "CTRL" => self.config.enable_ctrl,
            _ => true,
        };

        if !enabled {
            return;
        }

        let entry = LogEntry {
            level,
            subsystem,
            message: message.to_string(),
        };

        if self.config.max_entries > 0 {
            let mut entries = self.entries.lock().expect("log mutex poisoned");
            if entries.len() >= self.config.max_entries {
                entries.remove(0);
            }
            entries.push(entry);
        }

        #[cfg(any(test, debug_assertions))]
        {
            eprintln!("[{}] {}: {}", level, subsystem, message);
        }
    }

    pub fn trace(&self, subsystem: &'static str, message: impl fmt::Display) {
        self.log(LogLevel::Trace, subsystem, message);
    }

    pub fn debug(&self, subsystem: &'static str, message: impl fmt::Display) {
        self.log(LogLevel::Debug, subsystem, message);
    }

    pub fn info(&self, subsystem: &'static str, message: impl fmt::Display) {
        self.log(LogLevel::Info, subsystem, message);
    }

    pub fn warn(&self, subsystem: &'static str, message: impl fmt::Display) {
        self.log(LogLevel::Warn, subsystem, message);
    }

    pub fn error(&self, subsystem: &'static str, message: impl fmt::Display) {
        self.log(LogLevel::Error, subsystem, message);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().expect("log mutex poisoned").clone()
    }

    pub fn entries_for_subsystem(&self, subsystem: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.subsystem == subsystem)
            .collect()
    }

    pub fn entries_at_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.level >= level)
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("log mutex poisoned").clear();
    }

    pub fn to_string(&self) -> String {
        self.entries()
            .iter()
            .map(|e| format!("[{}] {}: {}", e.level, e.subsystem, e.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for SignalLogger {
    fn default() -> Self {
        Self {
            config: LogConfig::default(),
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl fmt::Display for SignalLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string())
    }
}

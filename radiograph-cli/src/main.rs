mod config;
mod logging;

use clap::Parser;
use color_eyre::eyre::{Context, Result};

use config::CliConfig;
use logging::{EngineLogRecord, LogEvent, StructuredLogger, SummaryEvent};
use radiograph_core::control::{Context as EngineContext, State};
use radiograph_core::graph::{BlockRegistry, CompositeRegistry, GraphDesc};
use radiograph_core::logging::SignalLogger;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Flow-graph engine runner", long_about = None)]
struct Cli {
    /// Path to the JSON graph description to load and run.
    graph: PathBuf,

    /// Path to a TOML runner configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose diagnostic output (forwards the engine's own log).
    #[arg(short, long)]
    verbose: bool,

    /// Run for this many seconds, then request a graceful stop (overrides
    /// `terminal.run_for_secs` from the config file). Omit to run until
    /// every source reaches EOF on its own.
    #[arg(short = 't', long)]
    run_for_secs: Option<f64>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();

    let mut config = if let Some(config_path) = &args.config {
        CliConfig::from_file(config_path)
            .wrap_err_with(|| format!("Failed to load config from {}", config_path))?
    } else {
        CliConfig::default()
    };

    if args.verbose {
        config.terminal.logging.level = config::LogLevel::Debug;
        config.terminal.logging.forward_engine_log = true;
    }
    if let Some(run_for_secs) = args.run_for_secs {
        config.terminal.run_for_secs = Some(run_for_secs);
    }

    let mut logger = StructuredLogger::new(config.terminal.logging.clone())?;

    logger.log(LogEvent::Info {
        message: format!("loading graph from {}", args.graph.display()),
    })?;

    let graph_json = std::fs::read_to_string(&args.graph)
        .wrap_err_with(|| format!("failed to read graph description {}", args.graph.display()))?;
    let graph: GraphDesc = serde_json::from_str(&graph_json)
        .wrap_err("failed to parse graph description as JSON")?;

    let registry = BlockRegistry::new();
    radiograph_core::blocks::register_fixture_blocks(&registry);

    let engine_logger: std::sync::Arc<SignalLogger> =
        SignalLogger::new(config.terminal.logging.to_core_log_config());
    let ctx = EngineContext::with_logger(
        registry,
        CompositeRegistry::new(),
        config.engine.clone(),
        engine_logger.clone(),
    );

    if let Err(e) = ctx.load(&graph) {
        logger.log(LogEvent::Error {
            message: "failed to load graph".to_string(),
            details: Some(e.to_string()),
        })?;
        std::process::exit(exit_code_for(&e));
    }

    logger.log(LogEvent::GraphLoaded {
        nodes: graph.nodes.len(),
        edges: graph.edges.len(),
    })?;

    if let Err(e) = ctx.start() {
        logger.log(LogEvent::Error {
            message: "failed to start graph".to_string(),
            details: Some(e.to_string()),
        })?;
        std::process::exit(exit_code_for(&e));
    }
    logger.log(LogEvent::StateChange { state: "Running".to_string() })?;

    let run_result = if let Some(run_for_secs) = config.terminal.run_for_secs {
        let watcher_ctx = ctx.clone();
        let watcher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs_f64(run_for_secs));
            let _ = watcher_ctx.stop();
        });
        let result = ctx.wait();
        let _ = watcher.join();
        result
    } else {
        ctx.wait()
    };

    if config.terminal.logging.forward_engine_log {
        for entry in engine_logger.entries() {
            logger.log(LogEvent::EngineLog(EngineLogRecord::from_entry(&entry)))?;
        }
    }

    let final_state = match ctx.status() {
        State::Stopped => "Stopped",
        State::Errored => "Errored",
        State::Running => "Running",
        State::Stopping => "Stopping",
        State::Loaded => "Loaded",
        State::Unloaded => "Unloaded",
    };
    logger.log(LogEvent::StateChange { state: final_state.to_string() })?;

    let error_message = run_result.as_ref().err().map(|e| e.to_string());
    logger.log(LogEvent::Summary(SummaryEvent {
        timestamp: chrono::Utc::now(),
        duration_secs: logger.elapsed(),
        final_state: final_state.to_string(),
        error: error_message.clone(),
    }))?;

    match run_result {
        Ok(()) => Ok(()),
        Err(e) => {
            let code = exit_code_for(&e);
            drop(logger);
            std::process::exit(code);
        }
    }
}

fn exit_code_for(err: &radiograph_core::errors::EngineError) -> i32 {
    use radiograph_core::config::exit_code;
    use radiograph_core::errors::ErrorKind;

    match err.kind() {
        ErrorKind::TypeMismatch | ErrorKind::Graph => exit_code::TYPE_MISMATCH,
        ErrorKind::Startup => exit_code::INIT_FAIL,
        ErrorKind::Runtime | ErrorKind::Io | ErrorKind::StopTimeout => exit_code::RUNTIME_FAIL,
    }
}

//! The control plane: `Context` and its state machine (C6, section 4.5).
//!
//! `Unloaded -> Loaded -> Running -> Stopping -> Stopped | Errored`. A
//! `Context` owns exactly one `GraphPlan`/`Scheduler` at a time; an embedder
//! wanting several independently running graphs creates several `Context`s
//! (section 9: "contexts never touch process-global state" other than the
//! one process-wide `SIGINT`/`SIGTERM` handler, which every live context
//! shares by registering itself in a weak-reference table).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::errors::{EngineError, GraphError, Result, StopTimeoutError};
use crate::graph::{build_plan, flatten, BlockRegistry, CompositeRegistry, GraphDesc};
use crate::logging::{LogConfig, SignalLogger};
use crate::scheduler::{Scheduler, ThreadWorkerBackend, WorkerOutcome};

/// Lifecycle state of a `Context` (section 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unloaded,
    Loaded,
    Running,
    Stopping,
    Stopped,
    Errored,
}

struct ContextInner {
    state: State,
    registry: BlockRegistry,
    composites: CompositeRegistry,
    config: Arc<EngineConfig>,
    logger: Arc<SignalLogger>,
    scheduler: Option<PlanOrScheduler>,
    source_rates: HashMap<String, f64>,
    last_error: Option<EngineError>,
    stop_requested_externally: Arc<AtomicBool>,
}

/// A loaded, runnable flow graph together with its runtime state.
///
/// Created via `Context::new`; every method takes `&self` behind an
/// internal mutex so a `Context` can be shared (e.g. with the process-wide
/// signal handler) as `Arc<Context>`.
pub struct Context {
    inner: Mutex<ContextInner>,
}

static SIGNAL_HANDLER_INSTALLED: Once = Once::new();
static LIVE_CONTEXTS: Mutex<Vec<Weak<Context>>> = Mutex::new(Vec::new());

impl Context {
    pub fn new(registry: BlockRegistry, composites: CompositeRegistry, config: EngineConfig) -> Arc<Self> {
        Self::with_logger(registry, composites, config, SignalLogger::new(LogConfig::default()))
    }

    pub fn with_logger(
        registry: BlockRegistry,
        composites: CompositeRegistry,
        config: EngineConfig,
        logger: Arc<SignalLogger>,
    ) -> Arc<Self> {
        let ctx = Arc::new(Self {
            inner: Mutex::new(ContextInner {
                state: State::Unloaded,
                registry,
                composites,
                config: Arc::new(config),
                logger,
                scheduler: None,
                source_rates: HashMap::new(),
                last_error: None,
                stop_requested_externally: Arc::new(AtomicBool::new(false)),
            }),
        });

        install_signal_handler();
        LIVE_CONTEXTS
            .lock()
            .expect("live contexts mutex poisoned")
            .push(Arc::downgrade(&ctx));

        ctx
    }

    /// Override a source block's nominal rate for rate inference (most
    /// sources have none, e.g. a file reader whose rate is arbitrary).
    pub fn set_source_rate(&self, node_id: impl Into<String>, rate: f64) {
        self.inner
            .lock()
            .expect("context mutex poisoned")
            .source_rates
            .insert(node_id.into(), rate);
    }

    /// Flatten composites, validate structure, run type/rate inference,
    /// and construct every block (section 4.2). Valid from `Unloaded`,
    /// `Stopped`, or `Errored`.
    pub fn load(&self, graph: &GraphDesc) -> Result<()> {
        let mut inner = self.inner.lock().expect("context mutex poisoned");
        match inner.state {
            State::Unloaded | State::Stopped | State::Errored => {}
            State::Loaded | State::Running | State::Stopping => {
                return Err(EngineError::Graph(GraphError::PortMismatch(
                    "cannot load a graph while one is already loaded or running".to_string(),
                )))
            }
        }

        let flat = flatten(graph, &inner.composites)?;
        let plan = build_plan(&flat, &inner.registry, &inner.source_rates)?;
        inner.logger.info(
            "CTRL",
            format!("loaded graph with {} nodes, {} edges", plan.nodes.len(), plan.edges.len()),
        );

        inner.scheduler = Some(PlanOrScheduler::Plan(plan));
        inner.state = State::Loaded;
        inner.last_error = None;
        Ok(())
    }

    /// Spawn one worker per node and transition to `Running` (section
    /// 4.4). Valid only from `Loaded`.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("context mutex poisoned");
        if inner.state != State::Loaded {
            return Err(EngineError::Graph(GraphError::PortMismatch(format!(
                "start() requires state Loaded, found {:?}",
                inner.state
            ))));
        }

        let plan = match inner.scheduler.take() {
            Some(PlanOrScheduler::Plan(plan)) => plan,
            _ => unreachable!("Loaded state always carries a plan"),
        };

        let config = inner.config.clone();
        let logger = inner.logger.clone();
        let scheduler = Scheduler::spawn(plan, config, logger.clone(), &ThreadWorkerBackend);
        logger.info("CTRL", "graph started");
        inner.scheduler = Some(PlanOrScheduler::Running(scheduler));
        inner.state = State::Running;
        Ok(())
    }

    /// Current lifecycle state.
    pub fn status(&self) -> State {
        self.inner.lock().expect("context mutex poisoned").state
    }

    /// Node ids still running, or an empty vector outside `Running`/
    /// `Stopping`.
    pub fn running_nodes(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("context mutex poisoned");
        match &inner.scheduler {
            Some(PlanOrScheduler::Running(s)) => s.running_nodes(),
            _ => Vec::new(),
        }
    }

    /// Block until the graph finishes on its own (every source reached
    /// EOF) or fails. Does not request a stop; for a graph with an
    /// unbounded source, call `stop()` instead.
    pub fn wait(&self) -> Result<()> {
        loop {
            {
                let inner = self.inner.lock().expect("context mutex poisoned");
                match &inner.scheduler {
                    Some(PlanOrScheduler::Running(s)) if s.all_finished() => break,
                    Some(PlanOrScheduler::Running(_)) => {}
                    _ => return Ok(()),
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.finish_and_reap()
    }

    /// Request every source to stop, then wait up to `EngineConfig::stop_grace`
    /// for the graph to drain (section 4.5). Idempotent: calling `stop()`
    /// again while already `Stopping` just keeps waiting.
    pub fn stop(&self) -> Result<()> {
        let (grace, already_requested) = {
            let mut inner = self.inner.lock().expect("context mutex poisoned");
            match inner.state {
                State::Running => {
                    inner.state = State::Stopping;
                    if let Some(PlanOrScheduler::Running(s)) = &inner.scheduler {
                        s.request_stop();
                    }
                    inner.logger.info("CTRL", "stop requested");
                    (inner.config.stop_grace, false)
                }
                State::Stopping => (inner.config.stop_grace, true),
                State::Stopped | State::Errored => return Ok(()),
                State::Unloaded | State::Loaded => {
                    return Err(EngineError::Graph(GraphError::PortMismatch(
                        "stop() requires a running graph".to_string(),
                    )))
                }
            }
        };
        let _ = already_requested;

        let deadline = Instant::now() + grace;
        loop {
            let finished = {
                let inner = self.inner.lock().expect("context mutex poisoned");
                matches!(&inner.scheduler, Some(PlanOrScheduler::Running(s)) if s.all_finished())
            };
            if finished {
                return self.finish_and_reap();
            }
            if Instant::now() >= deadline {
                let nodes = self.running_nodes();
                let mut inner = self.inner.lock().expect("context mutex poisoned");
                inner.state = State::Errored;
                let err = EngineError::StopTimeout(StopTimeoutError { nodes });
                inner.last_error = Some(err.clone());
                return Err(err);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Last error recorded for this context, formatted for display
    /// (section 6: `strerror`-style reporting).
    pub fn strerror(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("context mutex poisoned")
            .last_error
            .as_ref()
            .map(|e| e.to_string())
    }

    pub fn logger(&self) -> Arc<SignalLogger> {
        self.inner.lock().expect("context mutex poisoned").logger.clone()
    }

    fn finish_and_reap(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("context mutex poisoned");
        let scheduler = match inner.scheduler.take() {
            Some(PlanOrScheduler::Running(s)) => s,
            other => {
                inner.scheduler = other;
                return Ok(());
            }
        };

        let outcomes = scheduler.join_all();
        let failure = outcomes.into_iter().find_map(|(_, outcome)| match outcome {
            WorkerOutcome::Finished => None,
            WorkerOutcome::StartupFailed(e) => Some(EngineError::Startup(e)),
            WorkerOutcome::RuntimeFailed(e) => Some(EngineError::Runtime(e)),
            WorkerOutcome::IoFailed(e) => Some(EngineError::Io(e)),
        });

        match failure {
            Some(err) => {
                inner.logger.error("CTRL", format!("graph ended with error: {err}"));
                inner.last_error = Some(err.clone());
                inner.state = State::Errored;
                Err(err)
            }
            None => {
                inner.logger.info("CTRL", "graph finished");
                inner.state = State::Stopped;
                Ok(())
            }
        }
    }

    /// Invoked by the process-wide `SIGINT`/`SIGTERM` handler.
    fn handle_termination_signal(&self) {
        self.stop_requested_flag().store(true, Ordering::SeqCst);
        let _ = self.stop();
    }

    fn stop_requested_flag(&self) -> Arc<AtomicBool> {
        self.inner
            .lock()
            .expect("context mutex poisoned")
            .stop_requested_externally
            .clone()
    }
}

/// `Context::load` stores a plan; `Context::start` replaces it with a
/// running scheduler. Kept as one field so the mutex only needs one lock
/// per call.
enum PlanOrScheduler {
    Plan(crate::graph::GraphPlan),
    Running(Scheduler),
}

fn install_signal_handler() {
    SIGNAL_HANDLER_INSTALLED.call_once(|| {
        let _ = ctrlc::set_handler(|| {
            let contexts = LIVE_CONTEXTS.lock().expect("live contexts mutex poisoned");
            for weak in contexts.iter() {
                if let Some(ctx) = weak.upgrade() {
                    ctx.handle_termination_signal();
                }
            }
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, PortIn, PortOut, TypeSignature};
    use crate::errors::GraphError as GErr;
    use crate::graph::{BlockFactory, EdgeDesc, NodeDesc};
    use crate::types::{SampleType, Vector};
    use serde_json::Value as JsonValue;

    struct CountedSource {
        remaining: usize,
    }
    impl Block for CountedSource {
        fn class_name(&self) -> &'static str {
            "CountedSource"
        }
        fn type_signatures(&self) -> Vec<TypeSignature> {
            vec![TypeSignature::new(vec![], vec![PortOut::exact("out", SampleType::Float32)])]
        }
        fn process(&mut self, _inputs: &[Vector]) -> std::result::Result<Vec<Vector>, String> {
            if self.remaining == 0 {
                return Ok(vec![Vector::Float32(vec![])]);
            }
            let n = self.remaining.min(4);
            self.remaining -= n;
            Ok(vec![Vector::Float32(vec![0.0; n])])
        }
    }

    struct Sink;
    impl Block for Sink {
        fn class_name(&self) -> &'static str {
            "Sink"
        }
        fn type_signatures(&self) -> Vec<TypeSignature> {
            vec![TypeSignature::new(vec![PortIn::exact("in", SampleType::Float32)], vec![])]
        }
        fn process(&mut self, _inputs: &[Vector]) -> std::result::Result<Vec<Vector>, String> {
            Ok(vec![])
        }
    }

    struct CountedSourceFactory;
    impl BlockFactory for CountedSourceFactory {
        fn class_name(&self) -> &'static str {
            "CountedSource"
        }
        fn instantiate(&self, _config: &JsonValue) -> std::result::Result<Box<dyn Block>, GErr> {
            Ok(Box::new(CountedSource { remaining: 8 }))
        }
    }

    struct SinkFactory;
    impl BlockFactory for SinkFactory {
        fn class_name(&self) -> &'static str {
            "Sink"
        }
        fn instantiate(&self, _config: &JsonValue) -> std::result::Result<Box<dyn Block>, GErr> {
            Ok(Box::new(Sink))
        }
    }

    fn sample_graph() -> GraphDesc {
        GraphDesc {
            nodes: vec![
                NodeDesc { id: "src".into(), class_name: "CountedSource".into(), config: JsonValue::Null },
                NodeDesc { id: "sink".into(), class_name: "Sink".into(), config: JsonValue::Null },
            ],
            edges: vec![EdgeDesc { from_node: "src".into(), from_port: 0, to_node: "sink".into(), to_port: 0 }],
        }
    }

    #[test]
    fn state_machine_runs_to_completion() {
        let registry = BlockRegistry::new();
        registry.register(Arc::new(CountedSourceFactory));
        registry.register(Arc::new(SinkFactory));

        let ctx = Context::new(registry, CompositeRegistry::new(), EngineConfig::default());
        assert_eq!(ctx.status(), State::Unloaded);

        ctx.load(&sample_graph()).unwrap();
        assert_eq!(ctx.status(), State::Loaded);

        ctx.start().unwrap();
        assert_eq!(ctx.status(), State::Running);

        ctx.wait().unwrap();
        assert_eq!(ctx.status(), State::Stopped);
    }

    #[test]
    fn cannot_start_before_load() {
        let registry = BlockRegistry::new();
        let ctx = Context::new(registry, CompositeRegistry::new(), EngineConfig::default());
        assert!(ctx.start().is_err());
    }
}

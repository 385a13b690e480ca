//! The block model: named typed ports, multiple type signatures, and
//! lifecycle hooks (C2, section 4.1).

use std::fmt;
use std::sync::Arc;

use crate::errors::TypeMismatchError;
use crate::types::{SampleType, Vector};

/// `rate(input_rate) -> output_rate` for one type signature.
pub type RateFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// A predicate over candidate types, e.g. "any type implementing
/// stringification".
pub type TypePredicate = Arc<dyn Fn(&SampleType) -> bool + Send + Sync>;

/// Either a concrete type or a predicate over candidate types.
#[derive(Clone)]
pub enum TypeMatcher {
    Exact(SampleType),
    OneOf(Vec<SampleType>),
    Predicate {
        label: &'static str,
        test: TypePredicate,
    },
}

impl TypeMatcher {
    pub fn accepts(&self, t: &SampleType) -> bool {
        match self {
            TypeMatcher::Exact(s) => s == t,
            TypeMatcher::OneOf(opts) => opts.contains(t),
            TypeMatcher::Predicate { test, .. } => test(t),
        }
    }
}

impl fmt::Debug for TypeMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeMatcher::Exact(s) => write!(f, "{s}"),
            TypeMatcher::OneOf(opts) => {
                let names: Vec<String> = opts.iter().map(|s| s.to_string()).collect();
                write!(f, "one of [{}]", names.join(", "))
            }
            TypeMatcher::Predicate { label, .. } => write!(f, "<{label}>"),
        }
    }
}

/// Either a concrete type or a function of the resolved input types.
#[derive(Clone)]
pub enum TypeProducer {
    Exact(SampleType),
    FromInputs(Arc<dyn Fn(&[SampleType]) -> SampleType + Send + Sync>),
}

impl TypeProducer {
    pub fn resolve(&self, input_types: &[SampleType]) -> SampleType {
        match self {
            TypeProducer::Exact(s) => s.clone(),
            TypeProducer::FromInputs(f) => f(input_types),
        }
    }
}

/// One named, typed input port within a type signature.
#[derive(Clone)]
pub struct PortIn {
    pub name: String,
    pub matcher: TypeMatcher,
}

impl PortIn {
    pub fn exact(name: impl Into<String>, ty: SampleType) -> Self {
        Self {
            name: name.into(),
            matcher: TypeMatcher::Exact(ty),
        }
    }
}

/// One named, typed output port within a type signature.
#[derive(Clone)]
pub struct PortOut {
    pub name: String,
    pub producer: TypeProducer,
}

impl PortOut {
    pub fn exact(name: impl Into<String>, ty: SampleType) -> Self {
        Self {
            name: name.into(),
            producer: TypeProducer::Exact(ty),
        }
    }

    pub fn same_as_input(name: impl Into<String>, input_idx: usize) -> Self {
        Self {
            name: name.into(),
            producer: TypeProducer::FromInputs(Arc::new(move |inputs| inputs[input_idx].clone())),
        }
    }
}

/// One acceptable pairing of input types to output types and rate
/// transform for a block (section 3).
#[derive(Clone)]
pub struct TypeSignature {
    pub inputs: Vec<PortIn>,
    pub outputs: Vec<PortOut>,
    pub rate_fn: Option<RateFn>,
}

impl TypeSignature {
    pub fn new(inputs: Vec<PortIn>, outputs: Vec<PortOut>) -> Self {
        Self {
            inputs,
            outputs,
            rate_fn: None,
        }
    }

    pub fn with_rate(mut self, rate_fn: RateFn) -> Self {
        self.rate_fn = Some(rate_fn);
        self
    }

    /// Identity rate: `out_rate = in_rate`. This is the default applied
    /// when a signature registers no `rate_fn` (section 4.1).
    pub fn get_rate(&self, input_rate: f64) -> f64 {
        self.rate_fn
            .as_ref()
            .map(|f| f(input_rate))
            .unwrap_or(input_rate)
    }

    pub fn matches(&self, input_types: &[SampleType]) -> bool {
        self.inputs.len() == input_types.len()
            && self
                .inputs
                .iter()
                .zip(input_types)
                .all(|(p, t)| p.matcher.accepts(t))
    }
}

/// Select the first registered signature (registration order breaks ties)
/// whose input matchers accept `input_types`.
pub fn differentiate(
    node: &str,
    signatures: &[TypeSignature],
    input_types: &[SampleType],
) -> Result<usize, TypeMismatchError> {
    signatures
        .iter()
        .position(|sig| sig.matches(input_types))
        .ok_or_else(|| TypeMismatchError {
            node: node.to_string(),
            got: input_types.iter().map(|t| t.to_string()).collect(),
            expected: signatures
                .iter()
                .map(|sig| {
                    let parts: Vec<String> =
                        sig.inputs.iter().map(|p| format!("{:?}", p.matcher)).collect();
                    format!("({})", parts.join(", "))
                })
                .collect(),
        })
}

/// Declarative unit of computation: named typed ports, one or more type
/// signatures, and lifecycle hooks (instantiate/initialize/process/cleanup).
///
/// `instantiate` is ordinary Rust construction (a `new`/builder on the
/// concrete type) and is not part of this trait; everything the trait
/// exposes runs after a block has been constructed and wired into a graph.
pub trait Block: Send + 'static {
    /// Stable name used in error messages and graph descriptions.
    fn class_name(&self) -> &'static str;

    /// Registered type signatures, in the order `differentiate` should try
    /// them. Returned by value (signatures are cheap `Arc`-backed clones)
    /// so the trait stays object-safe without a lifetime parameter.
    fn type_signatures(&self) -> Vec<TypeSignature>;

    /// Opens files/devices and allocates state. Runs *inside* the worker,
    /// after the worker thread has started, so no resources cross a thread
    /// boundary. Default: no-op.
    fn initialize(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Consume one vector per input port, return one vector per output
    /// port. Must be deterministic given its inputs and the block's
    /// internal state. Sources (no input ports) are called with an empty
    /// slice and signal EOF by returning all-empty output vectors twice in
    /// a row.
    fn process(&mut self, inputs: &[Vector]) -> Result<Vec<Vector>, String>;

    /// Releases resources. Must be idempotent and safe to call after a
    /// partial `initialize`. Default: no-op.
    fn cleanup(&mut self) -> Result<(), String> {
        Ok(())
    }
}

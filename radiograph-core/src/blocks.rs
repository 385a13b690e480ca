//! Fixture blocks: sources and sinks sufficient to exercise every testable
//! property and end-to-end scenario in spec.md section 8. These illustrate
//! the block model (C2); the real DSP block library remains an external
//! collaborator per spec.md's own scope note.
//!
//! `RawFileSource`/`RawFileSink` cover the raw fixed-type file I/O of
//! scenarios S1-S3; `VectorSource` and `InfiniteSource` give tests an
//! in-memory source without touching the filesystem; `FunctionBlock` covers
//! the per-sample transform of S2; `NullSink` and `ThrottleSink` are sinks
//! for the fan-out (S3) and graceful-stop (S6) scenarios.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::block::{Block, PortIn, PortOut, TypeMatcher, TypeSignature};
use crate::errors::GraphError;
use crate::graph::{BlockFactory, BlockRegistry};
use crate::types::{SampleType, Vector};

const DEFAULT_CHUNK_ELEMENTS: usize = 4096;

/// Emits the raw little-endian bytes of a file as batches of `sample_type`,
/// opening the file in `initialize()` (it runs inside the worker, per
/// section 4.1) and signalling EOF with two consecutive all-empty outputs
/// once the file is exhausted.
pub struct RawFileSource {
    path: PathBuf,
    sample_type: SampleType,
    chunk_elements: usize,
    reader: Option<BufReader<File>>,
    exhausted: bool,
}

impl RawFileSource {
    pub fn new(path: impl Into<PathBuf>, sample_type: SampleType) -> Self {
        Self {
            path: path.into(),
            sample_type,
            chunk_elements: DEFAULT_CHUNK_ELEMENTS,
            reader: None,
            exhausted: false,
        }
    }

    pub fn with_chunk_elements(mut self, chunk_elements: usize) -> Self {
        self.chunk_elements = chunk_elements.max(1);
        self
    }
}

impl Block for RawFileSource {
    fn class_name(&self) -> &'static str {
        "RawFileSource"
    }

    fn type_signatures(&self) -> Vec<TypeSignature> {
        vec![TypeSignature::new(
            vec![],
            vec![PortOut::exact("out", self.sample_type.clone())],
        )]
    }

    fn initialize(&mut self) -> Result<(), String> {
        let file = File::open(&self.path)
            .map_err(|e| format!("RawFileSource: failed to open {}: {e}", self.path.display()))?;
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    fn process(&mut self, _inputs: &[Vector]) -> Result<Vec<Vector>, String> {
        if self.exhausted {
            return Ok(vec![Vector::empty_like(&self.sample_type)]);
        }

        let element_size = self
            .sample_type
            .element_size()
            .ok_or_else(|| "RawFileSource requires a fixed-size sample type".to_string())?;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| "RawFileSource not initialized".to_string())?;

        let mut buf = vec![0u8; element_size * self.chunk_elements];
        let mut filled = 0usize;
        loop {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    if filled == buf.len() {
                        break;
                    }
                }
                Err(e) => return Err(format!("RawFileSource: read failed: {e}")),
            }
        }

        if filled == 0 {
            self.exhausted = true;
            return Ok(vec![Vector::empty_like(&self.sample_type)]);
        }

        let whole = (filled / element_size) * element_size;
        buf.truncate(whole);
        Ok(vec![Vector::from_fixed_bytes(&self.sample_type, &buf)])
    }
}

/// Writes the raw little-endian bytes of every received vector to a file,
/// truncating it in `initialize()`. Accepts any fixed-size sample type (a
/// predicate matcher, section 4.1's "any type implementing stringification"
/// analog for "any fixed-size type").
pub struct RawFileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl RawFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }
}

impl Block for RawFileSink {
    fn class_name(&self) -> &'static str {
        "RawFileSink"
    }

    fn type_signatures(&self) -> Vec<TypeSignature> {
        vec![TypeSignature::new(
            vec![PortIn {
                name: "in".to_string(),
                matcher: TypeMatcher::Predicate {
                    label: "fixed-size type",
                    test: Arc::new(|t| t.is_fixed()),
                },
            }],
            vec![],
        )]
    }

    fn initialize(&mut self) -> Result<(), String> {
        let file = File::create(&self.path)
            .map_err(|e| format!("RawFileSink: failed to create {}: {e}", self.path.display()))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn process(&mut self, inputs: &[Vector]) -> Result<Vec<Vector>, String> {
        let bytes = inputs[0]
            .to_fixed_bytes()
            .ok_or_else(|| "RawFileSink received a non-fixed-size vector".to_string())?;
        if !bytes.is_empty() {
            let writer = self
                .writer
                .as_mut()
                .ok_or_else(|| "RawFileSink not initialized".to_string())?;
            writer
                .write_all(&bytes)
                .map_err(|e| format!("RawFileSink: write failed: {e}"))?;
        }
        Ok(vec![])
    }

    fn cleanup(&mut self) -> Result<(), String> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| format!("RawFileSink: flush failed: {e}"))?;
        }
        Ok(())
    }
}

/// An in-memory source that hands out a pre-built `Vector` in fixed-size
/// chunks, then signals EOF. Used where a test wants deterministic fixture
/// data without touching the filesystem (spec.md scenarios S2-S4).
pub struct VectorSource {
    data: Vector,
    chunk_elements: usize,
    position: usize,
}

impl VectorSource {
    pub fn new(data: Vector, chunk_elements: usize) -> Self {
        Self {
            data,
            chunk_elements: chunk_elements.max(1),
            position: 0,
        }
    }
}

impl Block for VectorSource {
    fn class_name(&self) -> &'static str {
        "VectorSource"
    }

    fn type_signatures(&self) -> Vec<TypeSignature> {
        vec![TypeSignature::new(
            vec![],
            vec![PortOut::exact("out", self.data.sample_type())],
        )]
    }

    fn process(&mut self, _inputs: &[Vector]) -> Result<Vec<Vector>, String> {
        if self.position >= self.data.len() {
            return Ok(vec![Vector::empty_like(&self.data.sample_type())]);
        }
        let end = (self.position + self.chunk_elements).min(self.data.len());
        let chunk = self.data.slice(self.position, end);
        self.position = end;
        Ok(vec![chunk])
    }
}

/// A source with no natural end: repeats a fixed pattern of `Byte` samples
/// forever. Paired with a `ThrottleSink` to exercise the graceful-stop
/// scenario (S6): the engine's own stop protocol, not the source's
/// `process()`, is what ends the run.
pub struct InfiniteSource {
    pattern: Vec<u8>,
    chunk_elements: usize,
}

impl InfiniteSource {
    pub fn new(pattern: Vec<u8>, chunk_elements: usize) -> Self {
        assert!(!pattern.is_empty(), "InfiniteSource requires a non-empty pattern");
        Self {
            pattern,
            chunk_elements: chunk_elements.max(1),
        }
    }
}

impl Block for InfiniteSource {
    fn class_name(&self) -> &'static str {
        "InfiniteSource"
    }

    fn type_signatures(&self) -> Vec<TypeSignature> {
        vec![TypeSignature::new(vec![], vec![PortOut::exact("out", SampleType::Byte)])]
    }

    fn process(&mut self, _inputs: &[Vector]) -> Result<Vec<Vector>, String> {
        let v: Vec<u8> = (0..self.chunk_elements)
            .map(|i| self.pattern[i % self.pattern.len()])
            .collect();
        Ok(vec![Vector::Byte(v)])
    }
}

/// Applies a per-vector function to its single input and forwards the
/// result, e.g. "multiply every Float32 sample by two" (spec.md S2). The
/// output type is declared at construction since the transform itself
/// (a plain Rust closure) can't be introspected for a `TypeProducer`.
pub struct FunctionBlock {
    name: &'static str,
    input_type: SampleType,
    output_type: SampleType,
    transform: Arc<dyn Fn(&Vector) -> Result<Vector, String> + Send + Sync>,
}

impl FunctionBlock {
    pub fn new(
        name: &'static str,
        input_type: SampleType,
        output_type: SampleType,
        transform: Arc<dyn Fn(&Vector) -> Result<Vector, String> + Send + Sync>,
    ) -> Self {
        Self {
            name,
            input_type,
            output_type,
            transform,
        }
    }

    /// `out[i] = in[i] * factor`, for `Float32` edges.
    pub fn multiply_float32(factor: f32) -> Self {
        Self::new(
            "Multiply",
            SampleType::Float32,
            SampleType::Float32,
            Arc::new(move |v| match v {
                Vector::Float32(xs) => Ok(Vector::Float32(xs.iter().map(|x| x * factor).collect())),
                _ => Err("Multiply expects Float32".to_string()),
            }),
        )
    }
}

impl Block for FunctionBlock {
    fn class_name(&self) -> &'static str {
        self.name
    }

    fn type_signatures(&self) -> Vec<TypeSignature> {
        vec![TypeSignature::new(
            vec![PortIn::exact("in", self.input_type.clone())],
            vec![PortOut::exact("out", self.output_type.clone())],
        )]
    }

    fn process(&mut self, inputs: &[Vector]) -> Result<Vec<Vector>, String> {
        Ok(vec![(self.transform)(&inputs[0])?])
    }
}

/// Discards everything it receives. Accepts any type; used to cap
/// fan-out edges that a test doesn't care to inspect.
pub struct NullSink;

impl Block for NullSink {
    fn class_name(&self) -> &'static str {
        "NullSink"
    }

    fn type_signatures(&self) -> Vec<TypeSignature> {
        vec![TypeSignature::new(
            vec![PortIn {
                name: "in".to_string(),
                matcher: TypeMatcher::Predicate {
                    label: "any type",
                    test: Arc::new(|_| true),
                },
            }],
            vec![],
        )]
    }

    fn process(&mut self, _inputs: &[Vector]) -> Result<Vec<Vector>, String> {
        Ok(vec![])
    }
}

/// Records every `Byte` vector it receives into a shared buffer, sleeping
/// `delay_per_batch` after each `process()` call to model a slow downstream
/// consumer (spec.md S6: "a throttled sink"). The delay is what gives
/// `stop()` something to wait out before the deadline.
pub struct ThrottleSink {
    captured: Arc<Mutex<Vec<u8>>>,
    delay_per_batch: Duration,
}

impl ThrottleSink {
    pub fn new(captured: Arc<Mutex<Vec<u8>>>, delay_per_batch: Duration) -> Self {
        Self {
            captured,
            delay_per_batch,
        }
    }
}

impl Block for ThrottleSink {
    fn class_name(&self) -> &'static str {
        "ThrottleSink"
    }

    fn type_signatures(&self) -> Vec<TypeSignature> {
        vec![TypeSignature::new(vec![PortIn::exact("in", SampleType::Byte)], vec![])]
    }

    fn process(&mut self, inputs: &[Vector]) -> Result<Vec<Vector>, String> {
        if let Vector::Byte(v) = &inputs[0] {
            self.captured.lock().expect("capture mutex poisoned").extend_from_slice(v);
        }
        std::thread::sleep(self.delay_per_batch);
        Ok(vec![])
    }
}

/// Registers every fixture block's factory under its `class_name`, the way
/// an embedder populates a `BlockRegistry` before `Context::load` (section
/// 9: explicit registry, no process-global self-registration). Blocks that
/// need construction parameters (`RawFileSource`'s path, `ThrottleSink`'s
/// capture buffer, ...) are expected to be registered directly by the
/// embedder instead; this only covers the parameterless/JSON-configurable
/// ones.
pub fn register_fixture_blocks(registry: &BlockRegistry) {
    registry.register(Arc::new(RawFileSourceFactory));
    registry.register(Arc::new(RawFileSinkFactory));
    registry.register(Arc::new(NullSinkFactory));
}

struct RawFileSourceFactory;
impl BlockFactory for RawFileSourceFactory {
    fn class_name(&self) -> &'static str {
        "RawFileSource"
    }

    fn instantiate(&self, config: &JsonValue) -> Result<Box<dyn Block>, GraphError> {
        let path = config
            .get("path")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| GraphError::PortMismatch("RawFileSource requires a string \"path\"".to_string()))?;
        let sample_type = parse_sample_type(config)?;
        Ok(Box::new(RawFileSource::new(Path::new(path), sample_type)))
    }
}

struct RawFileSinkFactory;
impl BlockFactory for RawFileSinkFactory {
    fn class_name(&self) -> &'static str {
        "RawFileSink"
    }

    fn instantiate(&self, config: &JsonValue) -> Result<Box<dyn Block>, GraphError> {
        let path = config
            .get("path")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| GraphError::PortMismatch("RawFileSink requires a string \"path\"".to_string()))?;
        Ok(Box::new(RawFileSink::new(Path::new(path))))
    }
}

struct NullSinkFactory;
impl BlockFactory for NullSinkFactory {
    fn class_name(&self) -> &'static str {
        "NullSink"
    }

    fn instantiate(&self, _config: &JsonValue) -> Result<Box<dyn Block>, GraphError> {
        Ok(Box::new(NullSink))
    }
}

fn parse_sample_type(config: &JsonValue) -> Result<SampleType, GraphError> {
    let name = config
        .get("sample_type")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| GraphError::PortMismatch("expected a string \"sample_type\"".to_string()))?;
    match name {
        "Complex32" => Ok(SampleType::Complex32),
        "Float32" => Ok(SampleType::Float32),
        "Bit" => Ok(SampleType::Bit),
        "Byte" => Ok(SampleType::Byte),
        other => Ok(SampleType::Object(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn raw_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bytes.bin");
        std::fs::write(&path, (0u8..=255).collect::<Vec<u8>>()).unwrap();

        let mut source = RawFileSource::new(&path, SampleType::Byte);
        source.initialize().unwrap();

        let mut collected = Vec::new();
        loop {
            let out = source.process(&[]).unwrap();
            let v = &out[0];
            if v.is_empty() {
                break;
            }
            if let Vector::Byte(bytes) = v {
                collected.extend_from_slice(bytes);
            }
        }
        assert_eq!(collected, (0u8..=255).collect::<Vec<u8>>());
    }

    #[test]
    fn raw_file_sink_writes_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut sink = RawFileSink::new(&path);
        sink.initialize().unwrap();
        sink.process(&[Vector::Byte(vec![1, 2, 3])]).unwrap();
        sink.cleanup().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn vector_source_chunks_then_eof() {
        let mut source = VectorSource::new(Vector::Float32(vec![1.0, 2.0, 3.0, 4.0, 5.0]), 2);
        let a = source.process(&[]).unwrap();
        let b = source.process(&[]).unwrap();
        let c = source.process(&[]).unwrap();
        let eof = source.process(&[]).unwrap();

        match (&a[0], &b[0], &c[0]) {
            (Vector::Float32(a), Vector::Float32(b), Vector::Float32(c)) => {
                assert_eq!(a, &vec![1.0, 2.0]);
                assert_eq!(b, &vec![3.0, 4.0]);
                assert_eq!(c, &vec![5.0]);
            }
            _ => panic!("wrong variant"),
        }
        assert!(eof[0].is_empty());
    }

    #[test]
    fn multiply_doubles_samples() {
        let mut block = FunctionBlock::multiply_float32(2.0);
        let out = block.process(&[Vector::Float32(vec![1.0, 2.0, 3.0])]).unwrap();
        match &out[0] {
            Vector::Float32(v) => assert_eq!(v, &vec![2.0, 4.0, 6.0]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn null_sink_accepts_any_type() {
        let mut sink = NullSink;
        let sigs = sink.type_signatures();
        assert!(sigs[0].inputs[0].matcher.accepts(&SampleType::Object("Frame".into())));
        assert!(sink.process(&[Vector::Byte(vec![1])]).unwrap().is_empty());
    }

    #[test]
    fn throttle_sink_captures_bytes() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let mut sink = ThrottleSink::new(captured.clone(), Duration::from_millis(1));
        sink.process(&[Vector::Byte(vec![9, 8, 7])]).unwrap();
        assert_eq!(*captured.lock().unwrap(), vec![9, 8, 7]);
    }
}

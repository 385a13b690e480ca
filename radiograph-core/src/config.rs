//! Runtime configuration knobs for the engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker-internal exit codes (section 6). The thread-backed worker model
/// (see DESIGN.md) reports these as a `WorkerOutcome` rather than a literal
/// process exit status, but the numeric values are kept stable for anyone
/// embedding a future `ProcessWorkerBackend`.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const INIT_FAIL: i32 = 1;
    pub const RUNTIME_FAIL: i32 = 2;
    pub const TYPE_MISMATCH: i32 = 3;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound, in bytes, on one fixed-size batched read off a pipe.
    /// Spec default: `1_048_576 / element_size` elements.
    pub pipe_chunk_bytes: usize,

    /// Minimum guaranteed OS pipe buffer size (section 4.3: "bounded queue
    /// of >= 64 KiB").
    pub pipe_min_buffer_bytes: usize,

    /// Deadline after which `stop()` gives up waiting for cooperative EOF
    /// shutdown and reports `StopTimeout` (section 4.5, default 5s).
    #[serde(with = "duration_secs")]
    pub stop_grace: Duration,

    /// Bound on per-edge dynamic buffering used to align rate-mismatched
    /// multi-input reads (section 9, Resolved Open Question 2).
    pub max_buffered_samples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipe_chunk_bytes: 1_048_576,
            pipe_min_buffer_bytes: 64 * 1024,
            stop_grace: Duration::from_secs(5),
            max_buffered_samples: 1 << 20,
        }
    }
}

impl EngineConfig {
    /// Element count for one batched fixed-size read, given an element size
    /// in bytes (spec: `1_048_576 / element_size`).
    pub fn chunk_elements(&self, element_size: usize) -> usize {
        (self.pipe_chunk_bytes / element_size.max(1)).max(1)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_elements_divides_by_element_size() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.chunk_elements(4), 262_144);
        assert_eq!(cfg.chunk_elements(8), 131_072);
        assert_eq!(cfg.chunk_elements(1), 1_048_576);
    }

    #[test]
    fn default_round_trips_through_json() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pipe_chunk_bytes, cfg.pipe_chunk_bytes);
        assert_eq!(back.stop_grace, cfg.stop_grace);
    }
}

//! Primitive sample types and the typed vector buffer that flows between
//! blocks (C1).
//!
//! Fixed types (`Complex32`, `Float32`, `Bit`, `Byte`) have a known
//! little-endian byte layout and permit raw block I/O. Object types are
//! named at runtime (e.g. a decoded frame produced by some external block
//! library) and serialize as a JSON value inside a length-prefixed frame.

use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// A sample type carried on an edge once type inference has run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleType {
    Complex32,
    Float32,
    Bit,
    Byte,
    /// A variable-size object type, identified by name (e.g. "DecodedFrame").
    Object(String),
}

impl SampleType {
    /// Byte size of one element, or `None` for variable-size object types.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            SampleType::Complex32 => Some(8),
            SampleType::Float32 => Some(4),
            SampleType::Bit | SampleType::Byte => Some(1),
            SampleType::Object(_) => None,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.element_size().is_some()
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleType::Complex32 => write!(f, "Complex32"),
            SampleType::Float32 => write!(f, "Float32"),
            SampleType::Bit => write!(f, "Bit"),
            SampleType::Byte => write!(f, "Byte"),
            SampleType::Object(name) => write!(f, "Object({name})"),
        }
    }
}

/// A contiguous typed buffer `{data, length, capacity}`, the unit passed to
/// `process()` and across pipes. `Vec<T>`'s own length/capacity stand in for
/// the struct-of-three the spec describes.
#[derive(Debug, Clone)]
pub enum Vector {
    Complex32(Vec<Complex32>),
    Float32(Vec<f32>),
    Bit(Vec<u8>),
    Byte(Vec<u8>),
    Object(String, Vec<JsonValue>),
}

impl Vector {
    pub fn sample_type(&self) -> SampleType {
        match self {
            Vector::Complex32(_) => SampleType::Complex32,
            Vector::Float32(_) => SampleType::Float32,
            Vector::Bit(_) => SampleType::Bit,
            Vector::Byte(_) => SampleType::Byte,
            Vector::Object(name, _) => SampleType::Object(name.clone()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Vector::Complex32(v) => v.len(),
            Vector::Float32(v) => v.len(),
            Vector::Bit(v) => v.len(),
            Vector::Byte(v) => v.len(),
            Vector::Object(_, v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn empty_like(sample_type: &SampleType) -> Self {
        match sample_type {
            SampleType::Complex32 => Vector::Complex32(Vec::new()),
            SampleType::Float32 => Vector::Float32(Vec::new()),
            SampleType::Bit => Vector::Bit(Vec::new()),
            SampleType::Byte => Vector::Byte(Vec::new()),
            SampleType::Object(name) => Vector::Object(name.clone(), Vec::new()),
        }
    }

    /// Truncate to the first `n` elements (used to align multi-input reads
    /// to `min(available across inputs)`, see scheduler.rs).
    pub fn truncate(&mut self, n: usize) {
        match self {
            Vector::Complex32(v) => v.truncate(n),
            Vector::Float32(v) => v.truncate(n),
            Vector::Bit(v) => v.truncate(n),
            Vector::Byte(v) => v.truncate(n),
            Vector::Object(_, v) => v.truncate(n),
        }
    }

    /// Raw little-endian bytes for a fixed-size sample type. `None` for
    /// object types, which use per-sample framing instead (see pipe.rs).
    pub fn to_fixed_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Vector::Complex32(v) => {
                let mut buf = Vec::with_capacity(v.len() * 8);
                for c in v {
                    buf.extend_from_slice(&c.re.to_le_bytes());
                    buf.extend_from_slice(&c.im.to_le_bytes());
                }
                Some(buf)
            }
            Vector::Float32(v) => {
                let mut buf = Vec::with_capacity(v.len() * 4);
                for s in v {
                    buf.extend_from_slice(&s.to_le_bytes());
                }
                Some(buf)
            }
            Vector::Bit(v) | Vector::Byte(v) => Some(v.clone()),
            Vector::Object(..) => None,
        }
    }

    /// Decode a whole number of elements of `sample_type` from `bytes`.
    /// `bytes` must be an exact multiple of the element size; the pipe
    /// reader is responsible for holding back any trailing partial element.
    pub fn from_fixed_bytes(sample_type: &SampleType, bytes: &[u8]) -> Self {
        match sample_type {
            SampleType::Complex32 => {
                let v = bytes
                    .chunks_exact(8)
                    .map(|c| {
                        let re = f32::from_le_bytes(c[0..4].try_into().unwrap());
                        let im = f32::from_le_bytes(c[4..8].try_into().unwrap());
                        Complex32::new(re, im)
                    })
                    .collect();
                Vector::Complex32(v)
            }
            SampleType::Float32 => {
                let v = bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                    .collect();
                Vector::Float32(v)
            }
            SampleType::Bit => Vector::Bit(bytes.to_vec()),
            SampleType::Byte => Vector::Byte(bytes.to_vec()),
            SampleType::Object(name) => Vector::Object(name.clone(), Vec::new()),
        }
    }

    pub fn object_items(&self) -> Option<&[JsonValue]> {
        match self {
            Vector::Object(_, items) => Some(items),
            _ => None,
        }
    }

    /// Removes and returns the first `n` elements, leaving the remainder in
    /// `self`. Used by the scheduler to carve a synchronized batch off a
    /// per-edge buffer without discarding whatever a fast producer read
    /// ahead of a slower sibling input (section 9, Resolved Open Question
    /// 2: dynamic buffering rather than dropping excess samples).
    pub fn drain_front(&mut self, n: usize) -> Self {
        match self {
            Vector::Complex32(v) => Vector::Complex32(v.drain(..n).collect()),
            Vector::Float32(v) => Vector::Float32(v.drain(..n).collect()),
            Vector::Bit(v) => Vector::Bit(v.drain(..n).collect()),
            Vector::Byte(v) => Vector::Byte(v.drain(..n).collect()),
            Vector::Object(name, v) => Vector::Object(name.clone(), v.drain(..n).collect()),
        }
    }

    /// Appends `other`'s elements onto the end of `self`. Panics if the two
    /// vectors carry different sample types (a scheduler invariant: a pipe
    /// only ever yields the one type its edge was inferred to carry).
    pub fn append(&mut self, other: Self) {
        match (self, other) {
            (Vector::Complex32(a), Vector::Complex32(mut b)) => a.append(&mut b),
            (Vector::Float32(a), Vector::Float32(mut b)) => a.append(&mut b),
            (Vector::Bit(a), Vector::Bit(mut b)) => a.append(&mut b),
            (Vector::Byte(a), Vector::Byte(mut b)) => a.append(&mut b),
            (Vector::Object(_, a), Vector::Object(_, mut b)) => a.append(&mut b),
            (a, b) => panic!("Vector::append: mismatched sample types {} vs {}", a.sample_type(), b.sample_type()),
        }
    }

    /// A contiguous sub-range `[start, end)`, used by fixture sources to
    /// hand out one chunk of a pre-built dataset per `process()` call.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        match self {
            Vector::Complex32(v) => Vector::Complex32(v[start..end].to_vec()),
            Vector::Float32(v) => Vector::Float32(v[start..end].to_vec()),
            Vector::Bit(v) => Vector::Bit(v[start..end].to_vec()),
            Vector::Byte(v) => Vector::Byte(v[start..end].to_vec()),
            Vector::Object(name, v) => Vector::Object(name.clone(), v[start..end].to_vec()),
        }
    }
}

//! Inter-worker pipes (C4, section 4.3).
//!
//! Fixed-size sample types flow as raw unframed little-endian bytes,
//! batched "as much as is available" per read up to
//! `EngineConfig::chunk_elements`; a trailing partial element is held back
//! until the next read completes it. Object types are framed individually
//! as `u32_le length` + JSON payload, one object per read (a documented
//! simplification: object batching never coalesces several objects into
//! one `Vector`, unlike the fixed-type path).

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::config::EngineConfig;
use crate::errors::IoError;
use crate::types::{SampleType, Vector};

/// One end of an OS pipe, opened with `nix::unistd::pipe` (section 9,
/// Resolved Open Question 1: real pipe fds even though workers are OS
/// threads, not processes, so the wire format stays identical to a future
/// process-backed worker).
pub struct PipeReader {
    fd: OwnedFd,
    sample_type: SampleType,
    /// Bytes read but not yet long enough to form a whole element.
    leftover: Vec<u8>,
}

pub struct PipeWriter {
    fd: OwnedFd,
    sample_type: SampleType,
}

/// Create a connected pipe pair for edges carrying `sample_type`.
pub fn pipe_for(sample_type: SampleType) -> Result<(PipeReader, PipeWriter), IoError> {
    let (read_fd, write_fd) = nix::unistd::pipe().map_err(|e| IoError {
        node: String::new(),
        op: "pipe".to_string(),
        errno: Some(e as i32),
        message: e.to_string(),
    })?;

    Ok((
        PipeReader {
            fd: read_fd,
            sample_type: sample_type.clone(),
            leftover: Vec::new(),
        },
        PipeWriter {
            fd: write_fd,
            sample_type,
        },
    ))
}

impl PipeReader {
    /// Raw fd, for building `select`-style readiness checks (unused by the
    /// current blocking-per-worker scheduler, kept for the documented
    /// `ProcessWorkerBackend` extension point).
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The sample type this pipe carries, so a caller can size an empty
    /// `Vector` of the right variant before any data has arrived.
    pub fn sample_type(&self) -> &SampleType {
        &self.sample_type
    }

    /// Read as much as is available, up to `config.chunk_elements(...)`
    /// elements, blocking until at least one byte (or EOF) arrives.
    /// Returns an empty vector at EOF.
    pub fn read_batch(&mut self, node: &str, config: &EngineConfig) -> Result<Vector, IoError> {
        match &self.sample_type.clone() {
            SampleType::Object(name) => self.read_one_object(node, name),
            fixed => self.read_fixed_batch(node, fixed, config),
        }
    }

    fn read_fixed_batch(
        &mut self,
        node: &str,
        sample_type: &SampleType,
        config: &EngineConfig,
    ) -> Result<Vector, IoError> {
        let element_size = sample_type.element_size().expect("fixed type has a known size");
        let max_bytes = config.chunk_elements(element_size) * element_size;

        let mut buf = vec![0u8; max_bytes];
        let n = loop {
            match read_fd(self.fd.as_raw_fd(), &mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(IoError {
                        node: node.to_string(),
                        op: "read".to_string(),
                        errno: e.raw_os_error(),
                        message: e.to_string(),
                    })
                }
            }
        };

        if n == 0 {
            // EOF: flush any leftover bytes as a best-effort partial element,
            // then report an empty vector on subsequent calls.
            if !self.leftover.is_empty() {
                let tail = std::mem::take(&mut self.leftover);
                return Ok(Vector::from_fixed_bytes(sample_type, &tail));
            }
            return Ok(Vector::empty_like(sample_type));
        }

        self.leftover.extend_from_slice(&buf[..n]);
        let whole_bytes = (self.leftover.len() / element_size) * element_size;
        let remainder = self.leftover.split_off(whole_bytes);
        let complete = std::mem::replace(&mut self.leftover, remainder);

        Ok(Vector::from_fixed_bytes(sample_type, &complete))
    }

    fn read_one_object(&mut self, node: &str, name: &str) -> Result<Vector, IoError> {
        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(self.fd.as_raw_fd(), &mut len_buf) {
            Ok(true) => {}
            Ok(false) => return Ok(Vector::Object(name.to_string(), Vec::new())),
            Err(e) => {
                return Err(IoError {
                    node: node.to_string(),
                    op: "read".to_string(),
                    errno: e.raw_os_error(),
                    message: e.to_string(),
                })
            }
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        read_exact_blocking(self.fd.as_raw_fd(), &mut payload).map_err(|e| IoError {
            node: node.to_string(),
            op: "read".to_string(),
            errno: e.raw_os_error(),
            message: e.to_string(),
        })?;

        let value: serde_json::Value = serde_json::from_slice(&payload).map_err(|e| IoError {
            node: node.to_string(),
            op: "read".to_string(),
            errno: None,
            message: format!("malformed object frame: {e}"),
        })?;

        Ok(Vector::Object(name.to_string(), vec![value]))
    }
}

impl PipeWriter {
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Write one batch. Blocks (ordinary pipe back-pressure) once the
    /// kernel buffer fills, which is how a slow consumer throttles its
    /// producer (section 4.3, "Pipes provide back-pressure").
    pub fn write_batch(&mut self, node: &str, vector: &Vector) -> Result<(), IoError> {
        match vector {
            Vector::Object(_, items) => {
                for item in items {
                    self.write_one_object(node, item)?;
                }
                Ok(())
            }
            fixed => {
                let bytes = fixed.to_fixed_bytes().expect("fixed sample type");
                if bytes.is_empty() {
                    return Ok(());
                }
                self.write_all(node, &bytes)
            }
        }
    }

    fn write_one_object(&mut self, node: &str, item: &serde_json::Value) -> Result<(), IoError> {
        let payload = serde_json::to_vec(item).map_err(|e| IoError {
            node: node.to_string(),
            op: "write".to_string(),
            errno: None,
            message: format!("failed to serialize object: {e}"),
        })?;
        let len = (payload.len() as u32).to_le_bytes();
        self.write_all(node, &len)?;
        self.write_all(node, &payload)
    }

    fn write_all(&mut self, node: &str, bytes: &[u8]) -> Result<(), IoError> {
        loop {
            match write_fd(self.fd.as_raw_fd(), bytes) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EPIPE) => {
                    return Err(IoError {
                        node: node.to_string(),
                        op: "write".to_string(),
                        errno: Some(libc::EPIPE),
                        message: "broken pipe (reader closed)".to_string(),
                    })
                }
                Err(e) => {
                    return Err(IoError {
                        node: node.to_string(),
                        op: "write".to_string(),
                        errno: e.raw_os_error(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    /// Closes the write end, signalling EOF to the reader.
    pub fn close(self) {
        drop(self);
    }
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    nix::unistd::read(fd, buf).map_err(io::Error::from)
}

fn write_fd(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, buf)
            .map_err(io::Error::from)?;
        buf = &buf[n..];
    }
    Ok(())
}

fn read_exact_blocking(fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_fd(fd, &mut buf[filled..])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed mid-frame"));
        }
        filled += n;
    }
    Ok(())
}

/// Like `read_exact_blocking`, but returns `Ok(false)` if EOF arrives before
/// any byte is read (a clean end-of-stream rather than a truncated frame).
fn read_exact_or_eof(fd: RawFd, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_fd(fd, &mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed mid-frame"));
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_round_trip_across_pipe() {
        let (mut reader, mut writer) = pipe_for(SampleType::Float32).unwrap();
        writer.write_batch("w", &Vector::Float32(vec![1.0, 2.0, 3.0])).unwrap();
        drop(writer);

        let config = EngineConfig::default();
        let mut collected = Vec::new();
        loop {
            let batch = reader.read_batch("r", &config).unwrap();
            if batch.is_empty() {
                break;
            }
            match batch {
                Vector::Float32(v) => collected.extend(v),
                _ => panic!("wrong variant"),
            }
        }
        assert_eq!(collected, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn object_round_trip_across_pipe() {
        let (mut reader, mut writer) = pipe_for(SampleType::Object("Frame".into())).unwrap();
        let item = serde_json::json!({"seq": 1, "payload": "hi"});
        writer
            .write_batch("w", &Vector::Object("Frame".into(), vec![item.clone()]))
            .unwrap();
        drop(writer);

        let config = EngineConfig::default();
        let batch = reader.read_batch("r", &config).unwrap();
        assert_eq!(batch.object_items().unwrap(), &[item]);

        let eof = reader.read_batch("r", &config).unwrap();
        assert!(eof.is_empty());
    }

    #[test]
    fn eof_on_empty_pipe_returns_empty_vector() {
        let (mut reader, writer) = pipe_for(SampleType::Byte).unwrap();
        drop(writer);
        let config = EngineConfig::default();
        let batch = reader.read_batch("r", &config).unwrap();
        assert!(batch.is_empty());
    }
}

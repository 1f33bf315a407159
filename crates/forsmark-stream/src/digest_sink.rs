#![forbid(unsafe_code)]

//! A write-only byte sink that feeds a streaming hash.
//!
//! Canonicalization writes many small chunks; a small user-space buffer in
//! front of the hash keeps per-byte updates off the hot path. The final
//! digest is taken exactly once, after the sink is closed.

use forsmark_core::{Error, Result};
use forsmark_crypto::digest::DigestAlgorithm;
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

const BUFFER_SIZE: usize = 4096;

pub struct DigestSink {
    hasher: Option<Box<dyn DigestAlgorithm>>,
    buffer: Vec<u8>,
    digest: Option<Vec<u8>>,
}

impl DigestSink {
    /// Create a sink for the given digest algorithm URI.
    pub fn new(digest_uri: &str) -> Result<Self> {
        Ok(Self {
            hasher: Some(forsmark_crypto::digest::from_uri(digest_uri)?),
            buffer: Vec::with_capacity(BUFFER_SIZE),
            digest: None,
        })
    }

    fn drain_buffer(&mut self) -> Result<()> {
        let hasher = self
            .hasher
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::other("digest sink already closed")))?;
        if !self.buffer.is_empty() {
            hasher.update(&self.buffer);
            self.buffer.clear();
        }
        Ok(())
    }

    /// Close the sink and finalize the hash. Writing afterwards fails.
    pub fn close(&mut self) -> Result<()> {
        self.drain_buffer()?;
        let hasher = self
            .hasher
            .take()
            .ok_or_else(|| Error::Io(io::Error::other("digest sink already closed")))?;
        self.digest = Some(hasher.finalize());
        Ok(())
    }

    /// Take the final digest; available exactly once, after `close`.
    pub fn take_digest(&mut self) -> Result<Vec<u8>> {
        self.digest
            .take()
            .ok_or_else(|| Error::Io(io::Error::other("digest not available")))
    }
}

impl Write for DigestSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.hasher.is_none() {
            return Err(io::Error::other("write after close"));
        }
        if self.buffer.len() + buf.len() > BUFFER_SIZE {
            let hasher = self.hasher.as_mut().expect("checked above");
            if !self.buffer.is_empty() {
                hasher.update(&self.buffer);
                self.buffer.clear();
            }
            if buf.len() > BUFFER_SIZE {
                hasher.update(buf);
                return Ok(buf.len());
            }
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A cloneable `Write` handle to a shared digest sink, so a transform
/// chain can own the writer while the verifier keeps access to the digest.
#[derive(Clone)]
pub struct SharedDigestSink(pub Rc<RefCell<DigestSink>>);

impl SharedDigestSink {
    pub fn new(digest_uri: &str) -> Result<Self> {
        Ok(Self(Rc::new(RefCell::new(DigestSink::new(digest_uri)?))))
    }

    pub fn close(&self) -> Result<()> {
        self.0.borrow_mut().close()
    }

    pub fn take_digest(&self) -> Result<Vec<u8>> {
        self.0.borrow_mut().take_digest()
    }
}

impl Write for SharedDigestSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forsmark_core::algorithm;

    #[test]
    fn test_digest_matches_one_shot() {
        let mut sink = DigestSink::new(algorithm::SHA256).unwrap();
        sink.write_all(b"hello ").unwrap();
        sink.write_all(b"world").unwrap();
        sink.close().unwrap();
        let digest = sink.take_digest().unwrap();
        assert_eq!(
            digest,
            forsmark_crypto::digest::digest(algorithm::SHA256, b"hello world").unwrap()
        );
    }

    #[test]
    fn test_write_after_close_fails() {
        let mut sink = DigestSink::new(algorithm::SHA1).unwrap();
        sink.write_all(b"data").unwrap();
        sink.close().unwrap();
        assert!(sink.write_all(b"more").is_err());
    }

    #[test]
    fn test_digest_taken_once() {
        let mut sink = DigestSink::new(algorithm::SHA1).unwrap();
        sink.close().unwrap();
        assert!(sink.take_digest().is_ok());
        assert!(sink.take_digest().is_err());
    }

    #[test]
    fn test_large_write_bypasses_buffer() {
        let big = vec![0xA5u8; BUFFER_SIZE * 3];
        let mut sink = DigestSink::new(algorithm::SHA256).unwrap();
        sink.write_all(&big).unwrap();
        sink.close().unwrap();
        assert_eq!(
            sink.take_digest().unwrap(),
            forsmark_crypto::digest::digest(algorithm::SHA256, &big).unwrap()
        );
    }
}

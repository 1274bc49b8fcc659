//! Media-type inference and the safe-list consulted by the write gate.
//!
//! The gate never blocks on content type alone; a recognised-safe type is a
//! pass, everything else falls through to the entropy check. Inference is
//! magic-byte based, so a payload is judged by its actual structure rather
//! than by file name or header claims.

use thiserror::Error;
use tracing::warn;

/// Media types that bypass the entropy check outright.
const SAFE_EXACT: &[&str] = &[
    "application/pdf",
    "application/x-executable",
    "application/x-sharedlib",
    "application/x-shellscript",
];

/// Prefix granting the whole `text/*` family a pass.
const SAFE_PREFIX: &str = "text/";

#[derive(Debug, Error)]
pub enum SniffError {
    #[error("content inspection failed: {0}")]
    Inspection(String),
}

/// A content-type oracle mapping a byte buffer to a media-type string.
///
/// Implementations must be deterministic for a given buffer. The production
/// sniffer is stateless and `Sync`, so concurrent callers share it without a
/// lock.
pub trait ContentSniffer: Send + Sync {
    fn media_type(&self, buf: &[u8]) -> Result<String, SniffError>;
}

/// Magic-byte sniffer backed by `infer`, extended with matchers for shell
/// scripts and printable text, which signature databases leave to heuristics.
pub struct MagicSniffer {
    inner: infer::Infer,
}

impl MagicSniffer {
    pub fn new() -> Self {
        let mut inner = infer::Infer::new();
        inner.add("application/x-shellscript", "sh", is_shellscript);
        inner.add("text/plain", "txt", is_plain_text);
        Self { inner }
    }
}

impl Default for MagicSniffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentSniffer for MagicSniffer {
    fn media_type(&self, buf: &[u8]) -> Result<String, SniffError> {
        if buf.is_empty() {
            return Ok("application/x-empty".to_owned());
        }
        Ok(self
            .inner
            .get(buf)
            .map(|kind| kind.mime_type().to_owned())
            .unwrap_or_else(|| "application/octet-stream".to_owned()))
    }
}

fn is_shellscript(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0] == b'#' && buf[1] == b'!'
}

/// Printable-text heuristic over the whole buffer: no NUL, no control bytes
/// outside the usual whitespace/escape set. Bytes above 0x7f are accepted so
/// UTF-8 text passes. The full payload is scanned; judging only a leading
/// window would let a payload with a harmless head smuggle an arbitrary tail
/// past the safe-list.
fn is_plain_text(buf: &[u8]) -> bool {
    !buf.is_empty()
        && buf.iter().all(|&b| {
            matches!(b, 0x20..=0x7e | b'\t' | b'\n' | b'\r' | 0x0c | 0x1b | 0x80..=0xff)
        })
}

/// The safe-list gatekeeper. Owns the process-wide sniffer handle acquired at
/// startup; dropping the classifier releases it.
pub struct Classifier {
    sniffer: Box<dyn ContentSniffer>,
}

impl Classifier {
    pub fn new(sniffer: Box<dyn ContentSniffer>) -> Self {
        Self { sniffer }
    }

    /// Whether `buf` may bypass the entropy check.
    ///
    /// True when the buffer opens with `#!`, when the inferred media type
    /// starts with `text/`, or when it equals one of the safe-listed
    /// application types (parameters such as `; charset=` stripped first).
    /// The shebang rule is checked before the sniffer runs so a sniffer
    /// failure cannot veto a shell wrapper. A sniffer failure is logged and
    /// treated as "not safe".
    pub fn is_safe(&self, buf: &[u8]) -> bool {
        if buf.len() >= 2 && buf.starts_with(b"#!") {
            return true;
        }
        match self.sniffer.media_type(buf) {
            Ok(mime) => {
                let essence = mime.split(';').next().unwrap_or_default().trim();
                essence.starts_with(SAFE_PREFIX) || SAFE_EXACT.contains(&essence)
            }
            Err(err) => {
                warn!(error = %err, "content classifier failed; treating payload as unsafe");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSniffer(&'static str);

    impl ContentSniffer for FixedSniffer {
        fn media_type(&self, _buf: &[u8]) -> Result<String, SniffError> {
            Ok(self.0.to_owned())
        }
    }

    struct FailingSniffer;

    impl ContentSniffer for FailingSniffer {
        fn media_type(&self, _buf: &[u8]) -> Result<String, SniffError> {
            Err(SniffError::Inspection("database unavailable".to_owned()))
        }
    }

    fn production() -> Classifier {
        Classifier::new(Box::new(MagicSniffer::new()))
    }

    #[test]
    fn plain_ascii_is_safe() {
        assert!(production().is_safe(b"hello there, perfectly ordinary prose"));
    }

    #[test]
    fn pdf_magic_is_safe() {
        let mut buf = b"%PDF-1.4\n%\xe2\xe3\xcf\xd3\n1 0 obj\n".to_vec();
        buf.extend_from_slice(&[0x00, 0x01, 0x02, 0x03]);
        assert!(production().is_safe(&buf));
    }

    #[test]
    fn elf_header_is_safe() {
        let mut buf = vec![0u8; 64];
        buf[0] = 0x7f;
        buf[1..4].copy_from_slice(b"ELF");
        buf[4] = 2; // 64-bit
        buf[5] = 1; // little endian
        buf[6] = 1; // version
        assert!(production().is_safe(&buf));
    }

    #[test]
    fn shebang_is_safe_regardless_of_body() {
        let mut buf = b"#!/bin/sh\n".to_vec();
        buf.extend((0..4086).map(|i: u32| (i.wrapping_mul(2654435761) >> 13) as u8));
        assert!(production().is_safe(&buf));
    }

    #[test]
    fn shebang_overrides_sniffer_failure() {
        let classifier = Classifier::new(Box::new(FailingSniffer));
        assert!(classifier.is_safe(b"#!/usr/bin/env bash\n"));
    }

    #[test]
    fn sniffer_failure_is_unsafe() {
        let classifier = Classifier::new(Box::new(FailingSniffer));
        assert!(!classifier.is_safe(b"anything else"));
    }

    #[test]
    fn binary_noise_is_unsafe() {
        let buf: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        assert!(!production().is_safe(&buf));
    }

    #[test]
    fn plain_head_does_not_whitewash_a_binary_tail() {
        let mut buf = b"ordinary prose keeps the head of this buffer looking harmless. "
            .repeat(8);
        assert!(buf.len() >= 504);
        buf.extend((0..3584u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8));
        assert!(!production().is_safe(&buf));
    }

    #[test]
    fn mime_parameters_are_stripped() {
        let classifier = Classifier::new(Box::new(FixedSniffer("application/pdf; version=1.7")));
        assert!(classifier.is_safe(b"irrelevant"));
    }

    #[test]
    fn text_prefix_must_anchor_at_the_start() {
        let classifier = Classifier::new(Box::new(FixedSniffer("application/vnd.text/odd")));
        assert!(!classifier.is_safe(b"irrelevant"));
    }

    #[test]
    fn short_buffers_have_pinned_types() {
        let sniffer = MagicSniffer::new();
        assert_eq!(sniffer.media_type(b"").unwrap(), "application/x-empty");
        assert_eq!(sniffer.media_type(b"hi").unwrap(), "text/plain");
        assert_eq!(
            sniffer.media_type(&[0x00, 0x01, 0x02]).unwrap(),
            "application/octet-stream"
        );
    }
}

//! Pluggable line checksums.
//!
//! Every log line carries a checksum token computed over its payload. The
//! strategy is injected by the caller: the default [`NoChecksum`] writes `0`
//! and accepts anything, [`Sha256Checksum`] writes a hex digest, and any
//! closure `Fn(&[u8], usize, usize) -> String` receives the buffer and the
//! byte range of the payload.

use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::sync::Arc;

/// Computes and validates the checksum token of a log line.
pub trait Checksum: Send + Sync {
    /// Computes the token for `buffer[start..end]`.
    fn digest(&self, buffer: &[u8], start: usize, end: usize) -> String;

    /// Returns `true` if `token` is valid for `buffer[start..end]`.
    fn verify(&self, buffer: &[u8], start: usize, end: usize, token: &str) -> bool {
        self.digest(buffer, start, end) == token
    }
}

impl<F> Checksum for F
where
    F: Fn(&[u8], usize, usize) -> String + Send + Sync,
{
    fn digest(&self, buffer: &[u8], start: usize, end: usize) -> String {
        self(buffer, start, end)
    }
}

/// The `none` checksum: always writes `0`, always validates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChecksum;

impl Checksum for NoChecksum {
    fn digest(&self, _buffer: &[u8], _start: usize, _end: usize) -> String {
        "0".to_string()
    }

    fn verify(&self, _buffer: &[u8], _start: usize, _end: usize, _token: &str) -> bool {
        true
    }
}

/// Lower-case hex SHA-256 of the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Checksum;

impl Checksum for Sha256Checksum {
    fn digest(&self, buffer: &[u8], start: usize, end: usize) -> String {
        let hash = Sha256::digest(&buffer[start..end]);
        let mut token = String::with_capacity(hash.len() * 2);
        for byte in hash {
            // Writing to a String cannot fail.
            let _ = write!(token, "{byte:02x}");
        }
        token
    }
}

/// Resolves a checksum strategy by name (`none` or `sha256`).
#[must_use]
pub fn checksum_by_name(name: &str) -> Option<Arc<dyn Checksum>> {
    match name {
        "none" => Some(Arc::new(NoChecksum)),
        "sha256" => Some(Arc::new(Sha256Checksum)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_accepts_anything() {
        let checksum = NoChecksum;
        assert_eq!(checksum.digest(b"abc", 0, 3), "0");
        assert!(checksum.verify(b"abc", 0, 3, "whatever"));
    }

    #[test]
    fn sha256_known_value() {
        let token = Sha256Checksum.digest(b"xabcx", 1, 4);
        assert_eq!(
            token,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(Sha256Checksum.verify(b"abc", 0, 3, &token));
        assert!(!Sha256Checksum.verify(b"abd", 0, 3, &token));
    }

    #[test]
    fn closure_receives_range() {
        let length = |_: &[u8], start: usize, end: usize| (end - start).to_string();
        assert_eq!(length.digest(b"hello", 1, 4), "3");
        assert!(length.verify(b"hello", 0, 5, "5"));
    }

    #[test]
    fn lookup_by_name() {
        assert!(checksum_by_name("none").is_some());
        assert!(checksum_by_name("sha256").is_some());
        assert!(checksum_by_name("md5").is_none());
    }
}

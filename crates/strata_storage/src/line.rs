//! Self-delimiting log lines.
//!
//! ```text
//! <decimal payload length> <checksum token> <payload bytes>\n
//! ```
//!
//! The payload is opaque binary; the declared length, not the newline,
//! delimits it. The newline only terminates the line.

use crate::checksum::Checksum;
use crate::error::LineFault;
use std::ops::Range;

/// Longest accepted decimal length field.
const MAX_LENGTH_DIGITS: usize = 20;

/// Longest accepted checksum token.
const MAX_TOKEN_LEN: usize = 128;

/// Payload prefix that marks a footer line.
pub const FOOTER_PREFIX: &[u8] = b"footer ";

/// A line located within a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Range of the payload within the buffer.
    pub payload: Range<usize>,
    /// Index just past the terminating newline.
    pub end: usize,
}

/// Outcome of decoding at a position in a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decode {
    /// A complete, valid line.
    Line(Line),
    /// The buffer ends before the line does; read more and try again.
    Incomplete,
}

/// Encodes `payload` as a complete log line.
#[must_use]
pub fn encode(checksum: &dyn Checksum, payload: &[u8]) -> Vec<u8> {
    let token = checksum.digest(payload, 0, payload.len());
    let length = payload.len().to_string();
    let mut line = Vec::with_capacity(length.len() + token.len() + payload.len() + 3);
    line.extend_from_slice(length.as_bytes());
    line.push(b' ');
    line.extend_from_slice(token.as_bytes());
    line.push(b' ');
    line.extend_from_slice(payload);
    line.push(b'\n');
    line
}

/// Encodes the footer payload recording where the newest checkpoint begins.
#[must_use]
pub fn footer_payload(checkpoint: u64) -> Vec<u8> {
    let mut payload = FOOTER_PREFIX.to_vec();
    payload.extend_from_slice(checkpoint.to_string().as_bytes());
    payload
}

/// Parses a footer payload, returning the checkpoint offset.
#[must_use]
pub fn parse_footer(payload: &[u8]) -> Option<u64> {
    let digits = payload.strip_prefix(FOOTER_PREFIX)?;
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Returns `true` if `payload` is a footer.
#[must_use]
pub fn is_footer(payload: &[u8]) -> bool {
    parse_footer(payload).is_some()
}

/// Finds the next space in `buffer[start..]`, giving up after `limit` bytes.
fn field_end(buffer: &[u8], start: usize, limit: usize) -> Result<Option<usize>, LineFault> {
    for (i, &byte) in buffer[start..].iter().enumerate() {
        if byte == b' ' {
            return if i == 0 {
                Err(LineFault::MissingHeader)
            } else {
                Ok(Some(start + i))
            };
        }
        if i >= limit || byte == b'\n' {
            return Err(LineFault::MissingHeader);
        }
    }
    if buffer.len() - start > limit {
        return Err(LineFault::MissingHeader);
    }
    Ok(None)
}

/// Decodes the line starting at `buffer[start]`.
///
/// # Errors
///
/// Returns the fault if the bytes present cannot be a valid line. Running
/// out of buffer is not an error; it yields [`Decode::Incomplete`] so the
/// caller can decide between reading more and reporting truncation.
pub fn decode(checksum: &dyn Checksum, buffer: &[u8], start: usize) -> Result<Decode, LineFault> {
    let Some(length_end) = field_end(buffer, start, MAX_LENGTH_DIGITS)? else {
        return Ok(Decode::Incomplete);
    };
    let digits = &buffer[start..length_end];
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(LineFault::MissingHeader);
    }
    let length: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(LineFault::MissingHeader)?;

    let token_start = length_end + 1;
    let Some(token_end) = field_end(buffer, token_start, MAX_TOKEN_LEN)? else {
        return Ok(Decode::Incomplete);
    };
    let token = std::str::from_utf8(&buffer[token_start..token_end])
        .map_err(|_| LineFault::MissingHeader)?;

    let payload_start = token_end + 1;
    let payload_end = payload_start
        .checked_add(length)
        .ok_or(LineFault::MissingHeader)?;
    if buffer.len() <= payload_end {
        return Ok(Decode::Incomplete);
    }
    if buffer[payload_end] != b'\n' {
        return Err(LineFault::Unterminated);
    }
    if !checksum.verify(buffer, payload_start, payload_end, token) {
        return Err(LineFault::InvalidChecksum);
    }

    Ok(Decode::Line(Line {
        payload: payload_start..payload_end,
        end: payload_end + 1,
    }))
}

/// Bytes needed past `start` before the line there can be fully decoded.
///
/// Only meaningful after [`decode`] returned [`Decode::Incomplete`] and the
/// header was complete; returns `None` while the header itself is partial.
#[must_use]
pub fn required_len(buffer: &[u8], start: usize) -> Option<usize> {
    let header = &buffer[start..];
    let first = header.iter().position(|&b| b == b' ')?;
    let second = header[first + 1..].iter().position(|&b| b == b' ')? + first + 1;
    let length: usize = std::str::from_utf8(&header[..first]).ok()?.parse().ok()?;
    Some(second + 1 + length + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{NoChecksum, Sha256Checksum};
    use proptest::prelude::*;

    fn line_of(decoded: Decode) -> Line {
        match decoded {
            Decode::Line(line) => line,
            Decode::Incomplete => panic!("expected a complete line"),
        }
    }

    #[test]
    fn encode_layout() {
        let line = encode(&NoChecksum, b"abc");
        assert_eq!(&line, b"3 0 abc\n");
    }

    #[test]
    fn decode_binary_payload_with_newlines() {
        let payload = b"a\nb\n\x00c";
        let line = encode(&Sha256Checksum, payload);
        let decoded = line_of(decode(&Sha256Checksum, &line, 0).unwrap());
        assert_eq!(&line[decoded.payload], payload);
        assert_eq!(decoded.end, line.len());
    }

    #[test]
    fn decode_at_offset() {
        let mut buffer = encode(&NoChecksum, b"first");
        let second = buffer.len();
        buffer.extend(encode(&NoChecksum, b"second"));
        let decoded = line_of(decode(&NoChecksum, &buffer, second).unwrap());
        assert_eq!(&buffer[decoded.payload], b"second");
    }

    #[test]
    fn partial_line_is_incomplete() {
        let line = encode(&NoChecksum, b"hello world");
        for cut in 1..line.len() {
            assert_eq!(
                decode(&NoChecksum, &line[..cut], 0).unwrap(),
                Decode::Incomplete,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn unsplittable_header_is_missing() {
        assert_eq!(
            decode(&NoChecksum, b"x x\n", 0),
            Err(LineFault::MissingHeader)
        );
        assert_eq!(
            decode(&NoChecksum, b" 0 abc\n", 0),
            Err(LineFault::MissingHeader)
        );
    }

    #[test]
    fn wrong_checksum_is_invalid() {
        let mut line = encode(&Sha256Checksum, b"abc");
        let last = line.len() - 2;
        line[last] = b'x';
        assert_eq!(
            decode(&Sha256Checksum, &line, 0),
            Err(LineFault::InvalidChecksum)
        );
    }

    #[test]
    fn missing_newline_is_unterminated() {
        assert_eq!(
            decode(&NoChecksum, b"1 0 ab", 0),
            Err(LineFault::Unterminated)
        );
    }

    #[test]
    fn footer_payloads() {
        let payload = footer_payload(1234);
        assert_eq!(parse_footer(&payload), Some(1234));
        assert!(is_footer(&payload));
        assert!(!is_footer(b"\x03footer"));
        assert_eq!(parse_footer(b"footer x"), None);
    }

    #[test]
    fn required_len_after_header() {
        let line = encode(&NoChecksum, b"0123456789");
        assert_eq!(required_len(&line[..6], 0), Some(line.len()));
        assert_eq!(required_len(&line[..2], 0), None);
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64), start in 0usize..8) {
            let start = start.min(bytes.len());
            let _ = decode(&Sha256Checksum, &bytes, start);
        }

        #[test]
        fn concatenated_lines_split_apart(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 1..8)
        ) {
            let buffer: Vec<u8> = payloads
                .iter()
                .flat_map(|p| encode(&Sha256Checksum, p))
                .collect();
            let mut position = 0;
            for payload in &payloads {
                let line = line_of(decode(&Sha256Checksum, &buffer, position).unwrap());
                prop_assert_eq!(&buffer[line.payload.clone()], &payload[..]);
                position = line.end;
            }
            prop_assert_eq!(position, buffer.len());
        }
    }
}

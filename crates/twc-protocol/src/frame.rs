use std::mem;

use thiserror::Error;

pub const FRAME_DELIMITER: u8 = 0xC0;
pub const ESCAPE: u8 = 0xDB;
pub const ESCAPED_DELIMITER: u8 = 0xDC;
pub const ESCAPED_ESCAPE: u8 = 0xDD;

/// Accepted decoded lengths, checksum byte included.
pub const VALID_FRAME_LENGTHS: [usize; 3] = [14, 16, 20];

/// Shortest raw frame (both delimiters included) the accumulator will hand out.
pub const MIN_RAW_FRAME_LEN: usize = 16;
/// Longest raw frame: every byte of a 20 byte message escaped, plus delimiters.
pub const MAX_RAW_FRAME_LEN: usize = 2 + 2 * 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("unexpected message length {0}")]
    Length(usize),
    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    Checksum { computed: u8, received: u8 },
    #[error("invalid escape sequence 0xdb {0:#04x}")]
    InvalidEscape(u8),
    #[error("escape byte at end of frame")]
    DanglingEscape,
}

impl FrameError {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            FrameError::Length(_) => "length",
            FrameError::Checksum { .. } => "checksum",
            FrameError::InvalidEscape(_) | FrameError::DanglingEscape => "escape",
        }
    }
}

/// Additive checksum over every byte after the first.
pub fn checksum(body: &[u8]) -> u8 {
    body.iter()
        .skip(1)
        .fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}

/// Append the checksum, escape, and wrap a message body in delimiters.
pub fn encode(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 4);
    out.push(FRAME_DELIMITER);
    for &byte in body.iter().chain(std::iter::once(&checksum(body))) {
        match byte {
            ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            FRAME_DELIMITER => out.extend_from_slice(&[ESCAPE, ESCAPED_DELIMITER]),
            other => out.push(other),
        }
    }
    out.push(FRAME_DELIMITER);
    out
}

/// Reverse [`encode`]: strip delimiters, unescape, check length and checksum.
///
/// Returns the message body without its trailing checksum byte.
pub fn decode(raw: &[u8]) -> Result<Vec<u8>, FrameError> {
    let inner = raw.strip_prefix(&[FRAME_DELIMITER]).unwrap_or(raw);
    let inner = inner.strip_suffix(&[FRAME_DELIMITER]).unwrap_or(inner);

    let mut message = unescape(inner)?;
    if !VALID_FRAME_LENGTHS.contains(&message.len()) {
        return Err(FrameError::Length(message.len()));
    }

    let received = message.pop().unwrap_or_default();
    let computed = checksum(&message);
    if computed != received {
        return Err(FrameError::Checksum { computed, received });
    }

    Ok(message)
}

fn unescape(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte != ESCAPE {
            out.push(byte);
            continue;
        }
        match bytes.next() {
            Some(ESCAPED_DELIMITER) => out.push(FRAME_DELIMITER),
            Some(ESCAPED_ESCAPE) => out.push(ESCAPE),
            Some(other) => return Err(FrameError::InvalidEscape(other)),
            None => return Err(FrameError::DanglingEscape),
        }
    }
    Ok(out)
}

/// Reassembles raw frames from a byte stream, one byte at a time.
///
/// Bytes before the first delimiter are noise. A delimiter arriving before a
/// full-length frame has accumulated restarts the frame at that delimiter.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
    discarded: usize,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            if byte == FRAME_DELIMITER {
                self.buf.push(byte);
            } else {
                self.discarded += 1;
            }
            return None;
        }

        if byte == FRAME_DELIMITER {
            if self.buf.len() + 1 >= MIN_RAW_FRAME_LEN {
                self.buf.push(byte);
                return Some(mem::take(&mut self.buf));
            }
            self.discarded += self.buf.len();
            self.buf.clear();
            self.buf.push(byte);
            return None;
        }

        self.buf.push(byte);
        if self.buf.len() > MAX_RAW_FRAME_LEN {
            self.discarded += self.buf.len();
            self.buf.clear();
        }
        None
    }

    pub fn extend(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|byte| self.push(*byte)).collect()
    }

    /// Number of bytes thrown away since the last call.
    pub fn take_discarded(&mut self) -> usize {
        mem::take(&mut self.discarded)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Space separated upper-case hex, as used in frame trace logs.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_skips_first_byte_and_wraps() {
        assert_eq!(checksum(&[0xFF, 0x01, 0x02]), 0x03);
        assert_eq!(checksum(&[0x00, 0xF0, 0x20]), 0x10);
        assert_eq!(checksum(&[0xAA]), 0x00);
    }

    #[test]
    fn unescape_rejects_bad_sequences() {
        assert_eq!(unescape(&[0x01, ESCAPE, 0x02]), Err(FrameError::InvalidEscape(0x02)));
        assert_eq!(unescape(&[0x01, ESCAPE]), Err(FrameError::DanglingEscape));
        assert_eq!(
            unescape(&[ESCAPE, ESCAPED_DELIMITER, ESCAPE, ESCAPED_ESCAPE]),
            Ok(vec![FRAME_DELIMITER, ESCAPE])
        );
    }

    #[test]
    fn hex_dump_formats_bytes() {
        assert_eq!(hex_dump(&[0xc0, 0x0a]), "C0 0A");
    }
}

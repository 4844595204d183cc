//! Line framing for the wire protocol.
//!
//! Requests and responses are byte lines terminated by `\n`. There is no
//! length prefix, handshake, or error payload. A `\r` before the `\n` is part
//! of the line content and is echoed back through the transform.

use bytes::{BufMut, Bytes, BytesMut};

/// Line delimiter.
pub const DELIMITER: u8 = b'\n';

/// Default maximum length of one line, delimiter excluded.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Result of trying to split one line off a receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameResult {
    /// A complete line, delimiter stripped.
    Line(Bytes),
    /// No delimiter yet; read more.
    Incomplete,
    /// More than `limit` bytes buffered with no delimiter.
    TooLong { limit: usize },
}

/// Splits lines off the front of a receive buffer.
///
/// Remembers how far the buffer was already searched for a delimiter, so a
/// long line arriving in many reads is scanned once.
#[derive(Debug, Clone, Copy)]
pub struct LineDecoder {
    max_line_length: usize,
    scanned: usize,
}

impl LineDecoder {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            scanned: 0,
        }
    }

    /// Split the next complete line off the front of `buffer`.
    ///
    /// On `Line`, the line and its delimiter are removed from the buffer.
    /// Otherwise the buffer is left untouched. Between calls, `buffer` may
    /// only grow at the back.
    pub fn decode(&mut self, buffer: &mut BytesMut) -> FrameResult {
        let limit = self.max_line_length;
        let from = self.scanned.min(buffer.len());

        match find_delimiter(&buffer[from..]).map(|i| from + i) {
            Some(pos) if pos > limit => FrameResult::TooLong { limit },
            Some(pos) => {
                self.scanned = 0;
                let mut line = buffer.split_to(pos + 1);
                line.truncate(pos);
                FrameResult::Line(line.freeze())
            }
            None if buffer.len() > limit => FrameResult::TooLong { limit },
            None => {
                self.scanned = buffer.len();
                FrameResult::Incomplete
            }
        }
    }
}

/// Append `line` plus the delimiter to `output`.
pub fn encode_line(line: &[u8], output: &mut BytesMut) {
    output.reserve(line.len() + 1);
    output.put_slice(line);
    output.put_u8(DELIMITER);
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_fresh(buf: &mut BytesMut, max: usize) -> FrameResult {
        LineDecoder::new(max).decode(buf)
    }

    #[test]
    fn test_single_line() {
        let mut buf = BytesMut::from(&b"hello\n"[..]);
        assert_eq!(
            decode_fresh(&mut buf, DEFAULT_MAX_LINE_LENGTH),
            FrameResult::Line(Bytes::from_static(b"hello"))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_lines_in_one_read() {
        let mut decoder = LineDecoder::new(16);
        let mut buf = BytesMut::from(&b"a\nb\npartial"[..]);
        assert_eq!(decoder.decode(&mut buf), FrameResult::Line(Bytes::from_static(b"a")));
        assert_eq!(decoder.decode(&mut buf), FrameResult::Line(Bytes::from_static(b"b")));
        assert_eq!(decoder.decode(&mut buf), FrameResult::Incomplete);
        assert_eq!(&buf[..], b"partial");
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut decoder = LineDecoder::new(DEFAULT_MAX_LINE_LENGTH);
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"this is ");
        assert_eq!(decoder.decode(&mut buf), FrameResult::Incomplete);
        assert_eq!(decoder.scanned, 8);

        buf.extend_from_slice(b"line 0");
        assert_eq!(decoder.decode(&mut buf), FrameResult::Incomplete);
        assert_eq!(decoder.scanned, 14);

        buf.extend_from_slice(b"\nnext\n");
        assert_eq!(
            decoder.decode(&mut buf),
            FrameResult::Line(Bytes::from_static(b"this is line 0"))
        );
        assert_eq!(decoder.scanned, 0);
        assert_eq!(decoder.decode(&mut buf), FrameResult::Line(Bytes::from_static(b"next")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_line_and_crlf() {
        let mut decoder = LineDecoder::new(16);
        let mut buf = BytesMut::from(&b"\nx\r\n"[..]);
        assert_eq!(decoder.decode(&mut buf), FrameResult::Line(Bytes::new()));
        assert_eq!(decoder.decode(&mut buf), FrameResult::Line(Bytes::from_static(b"x\r")));
    }

    #[test]
    fn test_too_long() {
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert_eq!(decode_fresh(&mut buf, 8), FrameResult::TooLong { limit: 8 });
        assert_eq!(buf.len(), 10);

        let mut buf = BytesMut::from(&b"0123456789\n"[..]);
        assert_eq!(decode_fresh(&mut buf, 8), FrameResult::TooLong { limit: 8 });

        // Exactly at the limit is fine.
        let mut buf = BytesMut::from(&b"01234567\n"[..]);
        assert_eq!(
            decode_fresh(&mut buf, 8),
            FrameResult::Line(Bytes::from_static(b"01234567"))
        );

        // A delimiter arriving after the limit was crossed is still too long.
        let mut decoder = LineDecoder::new(8);
        let mut buf = BytesMut::from(&b"01234"[..]);
        assert_eq!(decoder.decode(&mut buf), FrameResult::Incomplete);
        buf.extend_from_slice(b"56789\n");
        assert_eq!(decoder.decode(&mut buf), FrameResult::TooLong { limit: 8 });
    }

    #[test]
    fn test_encode_line() {
        let mut out = BytesMut::new();
        encode_line(b"HELLO", &mut out);
        encode_line(b"", &mut out);
        assert_eq!(&out[..], b"HELLO\n\n");
    }
}

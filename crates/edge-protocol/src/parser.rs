//! Per-connection byte buffer and line recognizer.

use crate::weighing::{self, ParseError};
use crate::Packet;

/// Buffer cap; on overflow the buffer is truncated to its tail half.
pub const MAX_BUFFER_BYTES: usize = 64 * 1024;

const HEARTBEAT: &[u8] = b"HB";
const ACK_PROMPT: &[u8] = b"KONTROLLU AKTAR OK?";
const REGISTRATION_PREFIX: &[u8] = b"SCALE-";
const REGISTRATION_LEN: usize = 8;

/// One result of feeding bytes into a [`ScaleBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Packet(Packet),
    /// A line was found at the head of the buffer but failed to parse as a
    /// weighing-event CSV. Non-fatal; the connection continues.
    Error(ParseError),
    /// The buffer exceeded [`MAX_BUFFER_BYTES`] and was truncated to its
    /// tail half. Carries the number of bytes discarded.
    BufferTruncated { discarded_bytes: usize },
}

/// Per-connection byte buffer that recognizes scale-stream packets.
///
/// Pure data-in-data-out: identical input produces an identical packet
/// sequence. Callers own one `ScaleBuffer` per socket.
#[derive(Debug, Default)]
pub struct ScaleBuffer {
    buf: Vec<u8>,
}

impl ScaleBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append `bytes` and drain every packet/line recognizable at the head.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ParseOutcome> {
        self.buf.extend_from_slice(bytes);

        let mut out = Vec::new();
        if self.buf.len() > MAX_BUFFER_BYTES {
            let keep_from = self.buf.len() - MAX_BUFFER_BYTES / 2;
            let discarded = keep_from;
            self.buf.drain(..keep_from);
            out.push(ParseOutcome::BufferTruncated {
                discarded_bytes: discarded,
            });
        }

        loop {
            if self.buf.is_empty() {
                break;
            }

            if self.buf.len() >= REGISTRATION_LEN
                && self.buf[..REGISTRATION_PREFIX.len()] == *REGISTRATION_PREFIX
                && self.buf[6].is_ascii_digit()
                && self.buf[7].is_ascii_digit()
            {
                let scale_number = format!(
                    "SCALE-{}{}",
                    self.buf[6] as char, self.buf[7] as char
                );
                self.consume(REGISTRATION_LEN);
                out.push(ParseOutcome::Packet(Packet::Registration { scale_number }));
                continue;
            }
            if is_partial_prefix(&self.buf, REGISTRATION_PREFIX) {
                break;
            }

            if self.buf.len() >= HEARTBEAT.len() && self.buf[..HEARTBEAT.len()] == *HEARTBEAT {
                self.consume(HEARTBEAT.len());
                out.push(ParseOutcome::Packet(Packet::Heartbeat));
                continue;
            }
            if is_partial_prefix(&self.buf, HEARTBEAT) {
                break;
            }

            if self.buf.len() >= ACK_PROMPT.len() && self.buf[..ACK_PROMPT.len()] == *ACK_PROMPT {
                self.consume(ACK_PROMPT.len());
                out.push(ParseOutcome::Packet(Packet::AckRequest));
                continue;
            }
            if is_partial_prefix(&self.buf, ACK_PROMPT) {
                break;
            }

            match find_line(&self.buf) {
                Some((line_end, delim_len)) => {
                    let line = String::from_utf8_lossy(&self.buf[..line_end])
                        .trim()
                        .to_owned();
                    self.consume(line_end + delim_len);
                    if line.is_empty() {
                        continue;
                    }
                    match weighing::parse_weighing_line(&line) {
                        Ok(rec) => out.push(ParseOutcome::Packet(Packet::Weighing(rec))),
                        Err(e) => out.push(ParseOutcome::Error(e)),
                    }
                }
                None => break,
            }
        }

        out
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// True if `buf` is a strict, shorter prefix of `literal` — i.e. more bytes
/// are needed before we can tell whether it matches.
fn is_partial_prefix(buf: &[u8], literal: &[u8]) -> bool {
    buf.len() < literal.len() && literal.starts_with(buf)
}

/// Find the first line terminator (`\r\n`, `\n`, or `\r`) in `buf`.
/// Returns `(line_end, delimiter_len)` where `line_end` is the index of the
/// first delimiter byte.
fn find_line(buf: &[u8]) -> Option<(usize, usize)> {
    for (i, &b) in buf.iter().enumerate() {
        if b == b'\n' {
            return Some((i, 1));
        }
        if b == b'\r' {
            if buf.get(i + 1) == Some(&b'\n') {
                return Some((i, 2));
            }
            return Some((i, 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_registration() {
        let mut b = ScaleBuffer::new();
        let out = b.feed(b"SCALE-01");
        assert_eq!(
            out,
            vec![ParseOutcome::Packet(Packet::Registration {
                scale_number: "SCALE-01".to_owned()
            })]
        );
        assert_eq!(b.pending_len(), 0);
    }

    #[test]
    fn recognizes_heartbeat_and_ack_prompt() {
        let mut b = ScaleBuffer::new();
        let out = b.feed(b"HBKONTROLLU AKTAR OK?");
        assert_eq!(
            out,
            vec![
                ParseOutcome::Packet(Packet::Heartbeat),
                ParseOutcome::Packet(Packet::AckRequest),
            ]
        );
    }

    #[test]
    fn waits_for_more_bytes_on_split_literal() {
        let mut b = ScaleBuffer::new();
        let out = b.feed(b"SCA");
        assert!(out.is_empty());
        assert_eq!(b.pending_len(), 3);
        let out2 = b.feed(b"LE-07");
        assert_eq!(
            out2,
            vec![ParseOutcome::Packet(Packet::Registration {
                scale_number: "SCALE-07".to_owned()
            })]
        );
    }

    #[test]
    fn parses_weighing_line_terminated_by_crlf() {
        let mut b = ScaleBuffer::new();
        let line = "00001,10:30:00,30.01.2026,KIYMA           ,2000001025004,000,MEHMET        ,0000002500,0000000000,0000037500,0,0,0,1,N,TEST COMPANY\r\n";
        let out = b.feed(line.as_bytes());
        assert_eq!(out.len(), 1);
        match &out[0] {
            ParseOutcome::Packet(Packet::Weighing(rec)) => {
                assert_eq!(rec.plu_code, "2000001025004");
            }
            other => panic!("expected weighing packet, got {other:?}"),
        }
    }

    #[test]
    fn reports_parse_error_without_dropping_connection_state() {
        let mut b = ScaleBuffer::new();
        let out = b.feed(b"too,few,fields\n");
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], ParseOutcome::Error(ParseError::TooFewFields(3))));
        // Buffer keeps working after a parse error.
        let out2 = b.feed(b"HB");
        assert_eq!(out2, vec![ParseOutcome::Packet(Packet::Heartbeat)]);
    }

    #[test]
    fn truncates_oversized_buffer_and_keeps_parsing() {
        let mut b = ScaleBuffer::new();
        // Feed more than the cap with no terminator, so it all accumulates.
        let junk = vec![b'x'; MAX_BUFFER_BYTES + 10];
        let out = b.feed(&junk);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], ParseOutcome::BufferTruncated { .. }));
        assert!(b.pending_len() <= MAX_BUFFER_BYTES);
    }

    #[test]
    fn identical_input_yields_identical_output() {
        let input: &[u8] = b"SCALE-02HB";
        let mut b1 = ScaleBuffer::new();
        let mut b2 = ScaleBuffer::new();
        assert_eq!(b1.feed(input), b2.feed(input));
    }
}

//! Scale-stream wire protocol: packet types and the per-connection parser.
//!
//! This crate is pure data-in-data-out, the way `ipico-core` is pure: no
//! sockets, no I/O, no logging. Callers own the connection and the buffer
//! map; they feed bytes in and get packets (and non-fatal parse errors) out.

mod parser;
mod weighing;

pub use parser::{ParseOutcome, ScaleBuffer, MAX_BUFFER_BYTES};
pub use weighing::{decode_weight_grams, parse_weighing_line, ParseError, ScaleTimestamp, WeighingRecord};

/// A single recognized unit from the scale stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// `SCALE-NN` registration literal.
    Registration { scale_number: String },
    /// `HB` heartbeat literal.
    Heartbeat,
    /// `KONTROLLU AKTAR OK?` acknowledgment prompt.
    AckRequest,
    /// A successfully parsed weighing-event CSV line.
    Weighing(WeighingRecord),
}

/// The server's fixed acknowledgment reply, sent for both an ack-prompt and
/// a successfully received weighing record — the scale does not distinguish
/// the two cases, so neither does this reply.
pub const ACK_REPLY: &[u8] = b"OK\n";

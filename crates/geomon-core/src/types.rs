//! Stream record types shared by every monitoring method.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical time of a record, taken from the trace.
pub type Timestamp = i64;

/// Identifier of a distributed stream.
pub type StreamId = u32;

/// Identifier of the site (host) that observed a record.
pub type SourceId = u32;

/// Record key. Keys are 32-bit on the wire.
pub type Key = u32;

/// Wire size of one stream record in bytes: timestamp (8), stream and
/// source ids (2+2), key (4). Used as the denominator of traffic
/// percentages.
pub const RECORD_WIRE_SIZE: usize = 16;

/// Wire size of a bare signal carrying only a sender identity
/// (e.g. a local-violation notification).
pub const SIGNAL_WIRE_SIZE: usize = 8;

/// Insert or delete a key occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamOp {
    Insert,
    Delete,
}

impl StreamOp {
    /// The signed frequency contribution of this operation.
    pub fn weight(self) -> f64 {
        match self {
            StreamOp::Insert => 1.0,
            StreamOp::Delete => -1.0,
        }
    }

    /// The operation that cancels this one.
    pub fn inverse(self) -> Self {
        match self {
            StreamOp::Insert => StreamOp::Delete,
            StreamOp::Delete => StreamOp::Insert,
        }
    }
}

/// One stream record. Records arrive in non-decreasing timestamp order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub ts: Timestamp,
    pub sid: StreamId,
    pub hid: SourceId,
    pub key: Key,
    pub op: StreamOp,
}

impl Record {
    pub fn new(ts: Timestamp, sid: StreamId, hid: SourceId, key: Key, op: StreamOp) -> Self {
        Self {
            ts,
            sid,
            hid,
            key,
            op,
        }
    }

    /// Signed frequency weight of this record.
    pub fn weight(&self) -> f64 {
        self.op.weight()
    }

    /// The record that undoes this one, stamped at `ts`.
    pub fn inverse_at(&self, ts: Timestamp) -> Self {
        Self {
            ts,
            op: self.op.inverse(),
            ..*self
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            StreamOp::Insert => "INS",
            StreamOp::Delete => "DEL",
        };
        write!(
            f,
            "[{} s{} h{} k{} {}]",
            self.ts, self.sid, self.hid, self.key, op
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_is_signed() {
        assert_eq!(StreamOp::Insert.weight(), 1.0);
        assert_eq!(StreamOp::Delete.weight(), -1.0);
    }

    #[test]
    fn inverse_record_flips_op() {
        let r = Record::new(10, 1, 0, 42, StreamOp::Insert);
        let inv = r.inverse_at(25);
        assert_eq!(inv.op, StreamOp::Delete);
        assert_eq!(inv.ts, 25);
        assert_eq!(inv.key, r.key);
        assert_eq!(inv.sid, r.sid);
    }

    #[test]
    fn display_is_compact() {
        let r = Record::new(3, 0, 2, 7, StreamOp::Delete);
        assert_eq!(r.to_string(), "[3 s0 h2 k7 DEL]");
    }
}

//! Byte-level framing: the per-datagram header and the multiplexed record stream carried inside
//!  reliable and unreliable data frames.
//!
//! Every datagram starts with a 5 byte header:
//!
//! ```ascii
//! 0: flags (bit 7 reliable, bit 6 ack, bit 5 connection, bit 4 disconnection)
//! 1: sequence number (u32 BE) - for acks, the sequence number being acknowledged
//! ```
//!
//! Data frames (no ack / connection / disconnection bit) carry a stream of records:
//!
//! ```ascii
//! 0: hint (u8) - 0 terminates the stream, 1 is a packet, 2 is a synced object diff
//! 1: skip distance (i32 BE) - number of payload bytes following
//! 5: payload
//! ```
//!
//! The skip distance allows a reader to step over a record it fails to decode without losing
//!  the rest of the datagram.

pub mod frame_header;
pub mod records;
pub mod sequence;

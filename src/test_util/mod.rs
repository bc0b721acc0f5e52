//! Fixtures for unit tests: a socket that records instead of sending, and a few packet and
//!  synced object types.

pub mod packets;
pub mod socket;
pub mod synced;

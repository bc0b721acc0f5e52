//! Client/server networking middleware for real-time applications: a reliability layer on top
//!  of UDP, a multiplexed record stream for application packets, and replication of synced
//!  objects from their owners to subscribed peers.
//!
//! Applications create a [server::Server] or a [client::Client]. Packets are queued with `send`
//!  and go out with the next tick, received packets are handed out by `recv_packet`, and
//!  connection and replication changes are published as [events::NetEvent]s.

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
mod endpoint;
pub mod events;
pub mod peer;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod tick;
pub mod transport;
pub mod util;

#[cfg(test)]
pub mod test_util;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::BytesMut;

use crate::peer::PeerProperties;

/// the largest payload a single UDP datagram can carry
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// How the tick loop is driven
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TickDriving {
    /// an internal timer runs one tick per `1000 / updates_per_second` milliseconds
    Automatic,
    /// the host application calls `tick()` itself
    Manual,
}

/// What the server does with synced objects owned by a peer that disconnects
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DisconnectionBehavior {
    DestroySyncedObjects,
    PreserveSyncedObjects,
}

#[derive(Debug, Clone, Default)]
pub struct PeerIdentity {
    /// Servers use this GUID as their own. Clients send only their properties, and are assigned
    ///  a GUID by the server they connect to. `None` generates a random GUID.
    pub guid: Option<String>,
    pub properties: PeerProperties,
}

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub bind_addr: SocketAddr,
    pub identity: PeerIdentity,

    /// bounds the connection handshake, and the time a server keeps a half-open channel
    pub connection_timeout: Duration,
    /// a ping that is not answered within this time takes the channel down
    pub disconnection_timeout: Duration,

    pub updates_per_second: u32,
    /// number of items in a reliable batch that trigger sending it before the tick's send phase ends
    pub reliable_group_size: usize,
    /// number of items in an unreliable batch that trigger sending it before the tick's send phase ends
    pub unreliable_group_size: usize,
    /// A batch is sent before adding a record would make it exceed this size. This should stay
    ///  below the path MTU to avoid IP fragmentation.
    pub max_datagram_size: usize,
    pub tick_driving: TickDriving,
    pub disconnection_behavior: DisconnectionBehavior,

    pub maintenance_interval: Duration,
    pub ping_interval: Duration,
    /// seed value for the rolling RTT average, before any ping was answered
    pub initial_rtt: Duration,
    pub min_resend_interval: Duration,
    /// unacknowledged reliable frames are resent after `resend_rtt_factor * rtt`
    pub resend_rtt_factor: f64,
    /// disconnect handshakes wait at most `disconnect_linger_rtt_factor * rtt`
    pub disconnect_linger_rtt_factor: f64,
    pub min_disconnect_linger: Duration,
}

impl NetConfig {
    pub fn new(bind_addr: SocketAddr) -> NetConfig {
        NetConfig {
            bind_addr,
            identity: PeerIdentity::default(),
            connection_timeout: Duration::from_secs(5),
            disconnection_timeout: Duration::from_secs(10),
            updates_per_second: 30,
            reliable_group_size: 32,
            unreliable_group_size: 16,
            max_datagram_size: 1200,
            tick_driving: TickDriving::Automatic,
            disconnection_behavior: DisconnectionBehavior::DestroySyncedObjects,
            maintenance_interval: Duration::from_millis(25),
            ping_interval: Duration::from_secs(1),
            initial_rtt: Duration::from_millis(200),
            min_resend_interval: Duration::from_millis(10),
            resend_rtt_factor: 1.25,
            disconnect_linger_rtt_factor: 6.0,
            min_disconnect_linger: Duration::from_millis(100),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.updates_per_second == 0 || self.updates_per_second > 1000 {
            bail!("updates per second must be between 1 and 1000, was {}", self.updates_per_second);
        }
        if self.reliable_group_size == 0 || self.unreliable_group_size == 0 {
            bail!("group sizes must be positive");
        }
        if self.max_datagram_size < 64 || self.max_datagram_size > MAX_UDP_PAYLOAD {
            bail!("max datagram size must be between 64 and {}, was {}", MAX_UDP_PAYLOAD, self.max_datagram_size);
        }
        if self.connection_timeout.is_zero() || self.disconnection_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        if self.maintenance_interval.is_zero() {
            bail!("maintenance interval must be positive");
        }
        if !(self.resend_rtt_factor >= 1.0) {
            bail!("resend RTT factor must be at least 1.0, was {}", self.resend_rtt_factor);
        }
        if !(self.disconnect_linger_rtt_factor > 0.0) {
            bail!("disconnect linger RTT factor must be positive, was {}", self.disconnect_linger_rtt_factor);
        }
        if let Some(guid) = &self.identity.guid {
            if guid.is_empty() {
                bail!("configured GUID must not be empty");
            }
        }
        self.identity.properties.ser(&mut BytesMut::new())
            .context("identity properties do not fit a connection handshake")?;
        Ok(())
    }

    pub fn tick_budget(&self) -> Duration {
        Duration::from_millis(1000 / self.updates_per_second as u64)
    }

    /// the bound for disconnect handshakes, derived from the measured RTT
    pub fn disconnect_linger(&self, rtt: Duration) -> Duration {
        rtt.mul_f64(self.disconnect_linger_rtt_factor)
            .max(self.min_disconnect_linger)
    }

    /// time after which an unacknowledged reliable frame is sent again
    pub fn resend_timeout(&self, rtt: Duration) -> Duration {
        rtt.mul_f64(self.resend_rtt_factor)
            .max(self.min_resend_interval)
    }
}

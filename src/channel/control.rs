use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::peer::PeerProperties;
use crate::protocol::frame_header::FrameFlags;
use crate::util::buf_ext::{BufExt, BufMutExt};

pub type AwaitableId = u16;

/// Why a server turned down a connection request
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Rejection {
    pub reason: String,
}
impl Rejection {
    pub fn new(reason: impl Into<String>) -> Rejection {
        Rejection { reason: reason.into() }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectionResult {
    Accepted {
        /// the GUID the server assigned to the requesting peer
        assigned_guid: String,
        remote_guid: String,
        remote_properties: PeerProperties,
    },
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum ControlKind {
    ConnectionRequest = 1,
    ConnectionResponse = 2,
    PingRequest = 3,
    PingResponse = 4,
    DisconnectionRequest = 5,
    DisconnectionResponse = 6,
}

const RESULT_ACCEPTED: u8 = 0;
const RESULT_REJECTED: u8 = 1;

/// Handshake and link maintenance messages. They travel as reliable frames in the same sequence
///  space as application data, so they are ordered with respect to it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlMessage {
    ConnectionRequest {
        awaitable: AwaitableId,
        /// random per connection attempt, distinguishes a restarted remote from a retransmission
        nonce: u64,
        properties: PeerProperties,
    },
    ConnectionResponse {
        awaitable: AwaitableId,
        result: ConnectionResult,
    },
    PingRequest {
        awaitable: AwaitableId,
    },
    PingResponse {
        awaitable: AwaitableId,
    },
    DisconnectionRequest {
        awaitable: AwaitableId,
        payload: Bytes,
    },
    DisconnectionResponse {
        awaitable: AwaitableId,
    },
}

impl ControlMessage {
    fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::ConnectionRequest { .. } => ControlKind::ConnectionRequest,
            ControlMessage::ConnectionResponse { .. } => ControlKind::ConnectionResponse,
            ControlMessage::PingRequest { .. } => ControlKind::PingRequest,
            ControlMessage::PingResponse { .. } => ControlKind::PingResponse,
            ControlMessage::DisconnectionRequest { .. } => ControlKind::DisconnectionRequest,
            ControlMessage::DisconnectionResponse { .. } => ControlKind::DisconnectionResponse,
        }
    }

    /// the frame flag marking this message's frame, in addition to the reliable flag
    pub fn frame_flag(&self) -> FrameFlags {
        match self {
            ControlMessage::DisconnectionRequest { .. } |
            ControlMessage::DisconnectionResponse { .. } => FrameFlags::DISCONNECTION,
            _ => FrameFlags::CONNECTION,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        buf.put_u8(self.kind().into());
        match self {
            ControlMessage::ConnectionRequest { awaitable, nonce, properties } => {
                buf.put_u16(*awaitable);
                buf.put_u64(*nonce);
                properties.ser(buf)?;
            }
            ControlMessage::ConnectionResponse { awaitable, result } => {
                buf.put_u16(*awaitable);
                match result {
                    ConnectionResult::Accepted { assigned_guid, remote_guid, remote_properties } => {
                        buf.put_u8(RESULT_ACCEPTED);
                        buf.put_string(assigned_guid)?;
                        buf.put_string(remote_guid)?;
                        remote_properties.ser(buf)?;
                    }
                    ConnectionResult::Rejected(rejection) => {
                        buf.put_u8(RESULT_REJECTED);
                        buf.put_string(&rejection.reason)?;
                    }
                }
            }
            ControlMessage::PingRequest { awaitable } |
            ControlMessage::PingResponse { awaitable } |
            ControlMessage::DisconnectionResponse { awaitable } => {
                buf.put_u16(*awaitable);
            }
            ControlMessage::DisconnectionRequest { awaitable, payload } => {
                buf.put_u16(*awaitable);
                buf.put_bytes_prefixed(payload)?;
            }
        }
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlMessage> {
        let kind = ControlKind::try_from(buf.try_u8()?)?;
        let awaitable = buf.try_u16()?;

        let result = match kind {
            ControlKind::ConnectionRequest => ControlMessage::ConnectionRequest {
                awaitable,
                nonce: buf.try_u64()?,
                properties: PeerProperties::deser(buf)?,
            },
            ControlKind::ConnectionResponse => {
                let result = match buf.try_u8()? {
                    RESULT_ACCEPTED => ConnectionResult::Accepted {
                        assigned_guid: buf.try_string()?,
                        remote_guid: buf.try_string()?,
                        remote_properties: PeerProperties::deser(buf)?,
                    },
                    RESULT_REJECTED => ConnectionResult::Rejected(Rejection::new(buf.try_string()?)),
                    other => anyhow::bail!("invalid connection result tag {}", other),
                };
                ControlMessage::ConnectionResponse { awaitable, result }
            }
            ControlKind::PingRequest => ControlMessage::PingRequest { awaitable },
            ControlKind::PingResponse => ControlMessage::PingResponse { awaitable },
            ControlKind::DisconnectionRequest => ControlMessage::DisconnectionRequest {
                awaitable,
                payload: buf.try_bytes()?,
            },
            ControlKind::DisconnectionResponse => ControlMessage::DisconnectionResponse { awaitable },
        };
        Ok(result)
    }
}

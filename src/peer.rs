use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::bail;
use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::util::buf_ext::{BufExt, BufMutExt, MAX_PREFIXED_LEN};

/// Immutable key/value metadata a peer announces during the connection handshake
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PeerProperties(BTreeMap<String, String>);
impl PeerProperties {
    pub fn new() -> PeerProperties {
        Default::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> PeerProperties {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        if self.0.len() > MAX_PREFIXED_LEN {
            bail!("at most {} peer properties are supported, got {}", MAX_PREFIXED_LEN, self.0.len());
        }
        buf.put_u16(self.0.len() as u16);
        for (k, v) in &self.0 {
            buf.put_string(k)?;
            buf.put_string(v)?;
        }
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PeerProperties> {
        let len = buf.try_u16()?;
        let mut map = BTreeMap::new();
        for _ in 0..len {
            let key = buf.try_string()?;
            let value = buf.try_string()?;
            map.insert(key, value);
        }
        Ok(PeerProperties(map))
    }
}

/// Identity of a connection endpoint. Two peers are the same if and only if their GUIDs match,
///  address and properties are informational.
#[derive(Clone)]
pub struct Peer {
    guid: Arc<str>,
    addr: SocketAddr,
    properties: Arc<PeerProperties>,
}
impl Peer {
    pub fn new(guid: impl Into<Arc<str>>, addr: SocketAddr, properties: PeerProperties) -> Peer {
        Peer {
            guid: guid.into(),
            addr,
            properties: Arc::new(properties),
        }
    }

    /// a fresh random GUID
    pub fn generate_guid() -> String {
        Uuid::new_v4().to_string()
    }

    /// A peer known only by GUID, e.g. the owner of a replicated object that is connected to the
    ///  server rather than to us
    pub fn unaddressed(guid: impl Into<Arc<str>>) -> Peer {
        Peer::new(guid, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), PeerProperties::default())
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn properties(&self) -> &PeerProperties {
        &self.properties
    }

    /// the same peer under a different GUID - the only mutation a peer sees, during the handshake
    pub fn with_guid(&self, guid: impl Into<Arc<str>>) -> Peer {
        Peer {
            guid: guid.into(),
            addr: self.addr,
            properties: self.properties.clone(),
        }
    }
}
impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
    }
}
impl Eq for Peer {}
impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.guid.hash(state)
    }
}
impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PEER{{{}@{}}}", self.guid, self.addr)
    }
}

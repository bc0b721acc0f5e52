use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, info, trace};

/// Abstraction over the datagram socket, introduced to keep the I/O part replaceable in tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Send errors are logged rather than returned: a datagram that does not leave this host is
    ///  indistinguishable from one that is lost on the way, and handled the same.
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]);

    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> SocketAddr;
}

pub struct UdpDatagramSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
}
impl UdpDatagramSocket {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpDatagramSocket> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("bound UDP socket to {:?}", local_addr);

        Ok(UdpDatagramSocket {
            socket,
            local_addr,
        })
    }
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);

        if let Err(e) = self.socket.send_to(buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::transport::socket::DatagramSocket;

/// Records sent datagrams instead of sending them, and never receives anything
pub struct RecordingSocket {
    local_addr: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}
impl RecordingSocket {
    pub fn new() -> RecordingSocket {
        RecordingSocket {
            local_addr: SocketAddr::from(([127, 0, 0, 1], 4000)),
            sent: Default::default(),
        }
    }

    pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl DatagramSocket for RecordingSocket {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        self.sent.lock().unwrap().push((to, buf.to_vec()));
    }

    async fn recv_datagram(&self, _buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        std::future::pending().await
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

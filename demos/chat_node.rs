use std::any::Any;
use std::net::SocketAddr;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use clap::Parser;
use clap_derive::Parser;
use syncnet::client::Client;
use syncnet::codec::{Packet, PacketRegistry, PacketType, PacketTypeId};
use syncnet::config::NetConfig;
use syncnet::events::NetEvent;
use syncnet::replication::registry::SyncedRegistry;
use syncnet::server::Server;
use syncnet::transport::ConnectOutcome;
use syncnet::util::buf_ext::{BufExt, BufMutExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{info, warn, Level};

#[derive(Debug, Clone)]
struct ChatLine {
    text: String,
}
impl Packet for ChatLine {
    fn packet_type(&self) -> PacketTypeId {
        Self::TYPE_ID
    }

    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_string(&self.text)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
impl PacketType for ChatLine {
    const TYPE_ID: PacketTypeId = 1;

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(ChatLine { text: buf.try_string()? })
    }
}

/// Runs a chat server that relays every line to all other clients, or a client that sends lines
///  from stdin
#[derive(Parser)]
struct Args {
    bind_address: String,

    /// connect to this server instead of running one
    #[clap(long)]
    server: Option<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = NetConfig::new(args.bind_address.parse()?);
    let packets = PacketRegistry::new().with::<ChatLine>()?;

    match args.server {
        None => run_server(config, packets).await,
        Some(server_addr) => run_client(config, packets, server_addr.parse()?).await,
    }
}

async fn run_server(config: NetConfig, packets: PacketRegistry) -> anyhow::Result<()> {
    let server = Server::bind(config, packets).await?;
    info!("chat server listening on {:?}", server.local_addr());
    let mut events = server.subscribe();

    loop {
        select! {
            received = server.recv_packet() => {
                let received = received.ok_or_else(|| anyhow!("server was disposed"))?;
                if let Some(line) = received.packet.as_any().downcast_ref::<ChatLine>() {
                    let text = format!("{}: {}", received.context.sender.guid(), line.text);
                    info!("{}", text);
                    server.broadcast_except(&received.context.sender, ChatLine { text })?;
                }
            }
            event = events.recv() => {
                match event? {
                    NetEvent::PeerConnected(peer) => info!("{:?} joined", peer),
                    NetEvent::PeerDisconnected { peer, reason, .. } => info!("{:?} left ({:?})", peer, reason),
                    _ => {}
                }
            }
        }
    }
}

async fn run_client(config: NetConfig, packets: PacketRegistry, server_addr: SocketAddr) -> anyhow::Result<()> {
    let client = Client::bind(config, packets, SyncedRegistry::new()).await?;
    match client.connect(server_addr).await? {
        ConnectOutcome::Success(server) => info!("connected to {:?} as {}", server, client.local_peer().guid()),
        other => return Err(anyhow!("could not connect to {:?}: {:?}", server_addr, other)),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            line = lines.next_line() => {
                match line? {
                    Some(text) => client.send(ChatLine { text })?,
                    None => break,
                }
            }
            received = client.recv_packet() => {
                let received = received.ok_or_else(|| anyhow!("client was disposed"))?;
                match received.packet.as_any().downcast_ref::<ChatLine>() {
                    Some(line) => println!("{}", line.text),
                    None => warn!("unexpected packet {:?}", received.packet),
                }
            }
        }
    }

    client.disconnect(Bytes::from_static(b"bye")).await?;
    client.dispose().await;
    Ok(())
}

//! TCP network
//!
//! Frame format: [LEN u32 LE][bincode(Envelope)]
//!
//! Each peer gets one outbound connection fed by a queue, so everything this
//! member sends to that peer arrives in send order. Inbound connections are
//! read by one task each and funnelled into the member's inbox. A failed
//! connection drops the frame in hand and reconnects on the next message.
//! A connection idle for `IDLE_TIMEOUT` is closed and its queue retired, so
//! peers that left the group do not pin a writer forever.

use crate::common::{Error, Result};
use crate::group::view::MemberId;
use crate::transport::message::{Envelope, Message};
use crate::transport::network::{Inbox, Network};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Upper bound on a single frame; snapshots are the largest messages
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Live members heartbeat far more often than this
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type Peers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>>;

pub struct TcpNetwork {
    local: MemberId,
    loopback: mpsc::UnboundedSender<Envelope>,
    peers: Peers,
    shutdown: watch::Sender<bool>,
}

impl TcpNetwork {
    /// Bind the member listener and start accepting peers.
    ///
    /// `advertise` is the address other members dial; it defaults to the
    /// bound address (useful with port 0).
    pub async fn bind(
        name: &str,
        bind_addr: SocketAddr,
        advertise: Option<String>,
    ) -> Result<(Arc<Self>, Inbox)> {
        let listener = TcpListener::bind(bind_addr).await?;
        let addr = match advertise {
            Some(addr) => addr,
            None => listener.local_addr()?.to_string(),
        };
        let local = MemberId::new(name, addr);
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        tracing::info!("Member transport listening on {} as {}", bind_addr, local);
        tokio::spawn(accept_loop(listener, tx.clone(), shutdown.subscribe()));

        let network = Arc::new(Self {
            local,
            loopback: tx,
            peers: Arc::default(),
            shutdown,
        });
        Ok((network, rx))
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Network for TcpNetwork {
    fn local(&self) -> &MemberId {
        &self.local
    }

    fn send(&self, to: &MemberId, message: Message) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::Unreachable(format!("{} (transport closed)", to)));
        }
        let envelope = Envelope {
            from: self.local.clone(),
            message,
        };
        if to.addr() == self.local.addr() {
            return self
                .loopback
                .send(envelope)
                .map_err(|_| Error::Unreachable(to.to_string()));
        }

        let mut peers = self.peers.lock();
        if let Some(queue) = peers.get(to.addr()) {
            match queue.send(envelope) {
                Ok(()) => return Ok(()),
                // Writer task is gone; start a fresh one below
                Err(mpsc::error::SendError(returned)) => {
                    peers.remove(to.addr());
                    let queue = spawn_writer(to.addr().to_string(), self.peers.clone());
                    queue
                        .send(returned)
                        .map_err(|_| Error::Unreachable(to.to_string()))?;
                    peers.insert(to.addr().to_string(), queue);
                    return Ok(());
                }
            }
        }
        let queue = spawn_writer(to.addr().to_string(), self.peers.clone());
        queue
            .send(envelope)
            .map_err(|_| Error::Unreachable(to.to_string()))?;
        peers.insert(to.addr().to_string(), queue);
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.peers.lock().clear();
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbox: mpsc::UnboundedSender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Accepted member connection from {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("set_nodelay failed for {}: {}", peer, e);
                    }
                    tokio::spawn(read_loop(stream, inbox.clone(), shutdown.clone()));
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            }
        }
    }
}

async fn read_loop(
    stream: TcpStream,
    inbox: mpsc::UnboundedSender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(stream);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(envelope)) => {
                    if inbox.send(envelope).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Closing member connection: {}", e);
                    break;
                }
            }
        }
    }
}

fn spawn_writer(addr: String, peers: Peers) -> mpsc::UnboundedSender<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(addr, rx, peers));
    tx
}

async fn write_loop(addr: String, mut queue: mpsc::UnboundedReceiver<Envelope>, peers: Peers) {
    let mut stream: Option<BufWriter<TcpStream>> = None;
    loop {
        let envelope = match tokio::time::timeout(IDLE_TIMEOUT, queue.recv()).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(_) => {
                // Senders enqueue under the registry lock, so an empty queue
                // here stays empty once the entry is gone
                let mut registry = peers.lock();
                match queue.try_recv() {
                    Ok(envelope) => envelope,
                    Err(_) => {
                        registry.remove(&addr);
                        tracing::debug!("Closing idle connection to {}", addr);
                        break;
                    }
                }
            }
        };
        if stream.is_none() {
            stream = match connect(&addr).await {
                Ok(s) => Some(BufWriter::new(s)),
                Err(e) => {
                    tracing::debug!("Dropping {} to {}: {}", envelope.message.kind(), addr, e);
                    continue;
                }
            };
        }
        let Some(writer) = stream.as_mut() else {
            continue;
        };
        if let Err(e) = write_frame(writer, &envelope).await {
            tracing::debug!("Connection to {} failed: {}", addr, e);
            stream = None;
        }
    }
}

async fn connect(addr: &str) -> Result<TcpStream> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Unreachable(format!("{} (connect timeout)", addr)))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let bytes = envelope.encode()?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::Codec(format!(
            "frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    writer.write_u32_le(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(Error::Corrupted(format!("frame length {} exceeds limit", len)));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Envelope::decode(&bytes).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::view::ViewId;

    #[tokio::test]
    async fn test_frame_stream() {
        let from = MemberId::new("A", "127.0.0.1:1");
        let mut buf = Vec::new();
        for request_id in 0..2 {
            let envelope = Envelope {
                from: from.clone(),
                message: Message::StateRequest { request_id },
            };
            write_frame(&mut buf, &envelope).await.unwrap();
        }

        let mut reader = buf.as_slice();
        let first = read_frame(&mut reader).await.unwrap().unwrap();
        let second = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.message, Message::StateRequest { request_id: 0 });
        assert_eq!(second.message, Message::StateRequest { request_id: 1 });
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        let mut reader = buf.as_slice();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(Error::Corrupted(_))
        ));
    }

    #[tokio::test]
    async fn test_loopback_and_peer_delivery() {
        let (a, mut a_inbox) = TcpNetwork::bind("A", "127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let (b, mut b_inbox) = TcpNetwork::bind("B", "127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();

        let heartbeat = Message::Heartbeat { view: ViewId(1) };
        a.send(a.local(), heartbeat.clone()).unwrap();
        assert_eq!(a_inbox.recv().await.unwrap().message, heartbeat);

        for request_id in 0..5 {
            a.send(b.local(), Message::StateRequest { request_id }).unwrap();
        }
        for expected in 0..5 {
            let envelope = b_inbox.recv().await.unwrap();
            assert_eq!(envelope.from, *a.local());
            assert_eq!(
                envelope.message,
                Message::StateRequest {
                    request_id: expected
                }
            );
        }

        a.shutdown();
        assert!(a.send(b.local(), heartbeat).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_writer_retires() {
        let peers: Peers = Arc::default();
        let addr = "127.0.0.1:9".to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        peers.lock().insert(addr.clone(), tx);

        let writer = tokio::spawn(write_loop(addr, rx, peers.clone()));
        tokio::time::sleep(IDLE_TIMEOUT * 2).await;
        writer.await.unwrap();
        assert!(peers.lock().is_empty());
    }
}

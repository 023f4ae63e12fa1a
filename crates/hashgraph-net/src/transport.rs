//! Framed peer connections
//!
//! A [`Connection`] wraps any byte stream (mutually authenticated TLS over
//! TCP in production, in-memory duplex pipes in tests) and exchanges
//! [`Message`]s. The read and write halves can be driven concurrently so both
//! peers may stream events at once.

use crate::framing::{FrameCodec, FrameError};
use crate::messages::Message;
use crate::peer::PeerInfo;
use crate::tls::{TlsContext, TlsError};
use futures::{SinkExt, StreamExt};
use hashgraph_core::types::NodeId;
use parking_lot::RwLock;
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    #[error("Connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("TLS handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),
    #[error("Peer not found: {0}")]
    PeerNotFound(NodeId),
    #[error("Peer at {0} presented a certificate that is not pinned")]
    UnpinnedCertificate(SocketAddr),
}

/// Receiving half of a connection
pub struct ConnectionReader<S> {
    inner: FramedRead<ReadHalf<S>, FrameCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ConnectionReader<S> {
    /// Receive the next message
    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        match self.inner.next().await {
            Some(frame) => Ok(Message::from_frame(&frame?)?),
            None => Err(TransportError::ConnectionClosed),
        }
    }
}

/// Sending half of a connection
pub struct ConnectionWriter<S> {
    inner: FramedWrite<WriteHalf<S>, FrameCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ConnectionWriter<S> {
    /// Send a message and flush it
    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        self.inner.send(message.to_frame()?).await?;
        Ok(())
    }

    /// Queue several messages and flush once
    pub async fn send_all(&mut self, messages: &[Message]) -> Result<(), TransportError> {
        for message in messages {
            self.inner.feed(message.to_frame()?).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }
}

/// Bidirectional framed connection
pub struct Connection<S> {
    reader: ConnectionReader<S>,
    writer: ConnectionWriter<S>,
    remote_addr: Option<SocketAddr>,
    /// Roster member authenticated by the TLS handshake
    peer: Option<NodeId>,
}

/// TLS stream of a dialed or accepted peer
pub type PeerStream = TlsStream<TcpStream>;

/// Authenticated connection to a roster peer
pub type PeerConnection = Connection<PeerStream>;

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Wrap a stream with the default frame limit
    pub fn new(stream: S) -> Self {
        Self::with_codec(stream, FrameCodec::new, None, None)
    }

    /// Wrap a stream with a custom frame limit
    pub fn with_max_frame_size(stream: S, max_frame_size: usize) -> Self {
        Self::with_codec(
            stream,
            || FrameCodec::with_max_frame_size(max_frame_size),
            None,
            None,
        )
    }

    fn with_codec(
        stream: S,
        codec: impl Fn() -> FrameCodec,
        remote_addr: Option<SocketAddr>,
        peer: Option<NodeId>,
    ) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: ConnectionReader {
                inner: FramedRead::new(read, codec()),
            },
            writer: ConnectionWriter {
                inner: FramedWrite::new(write, codec()),
            },
            remote_addr,
            peer,
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Node proven by the TLS handshake, None for unauthenticated streams
    pub fn authenticated_peer(&self) -> Option<NodeId> {
        self.peer
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        self.writer.send(message).await
    }

    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        self.reader.recv().await
    }

    /// Borrow both halves for concurrent use
    pub fn split_mut(&mut self) -> (&mut ConnectionReader<S>, &mut ConnectionWriter<S>) {
        (&mut self.reader, &mut self.writer)
    }
}

impl PeerConnection {
    fn from_tls(
        stream: PeerStream,
        max_frame_size: usize,
        remote_addr: SocketAddr,
        peer: NodeId,
    ) -> Self {
        Self::with_codec(
            stream,
            || FrameCodec::with_max_frame_size(max_frame_size),
            Some(remote_addr),
            Some(peer),
        )
    }
}

/// Address book, dialer and TLS acceptor for roster peers
pub struct Transport {
    tls: TlsContext,
    /// Known peers
    known_peers: RwLock<HashMap<NodeId, PeerInfo>>,
    connect_timeout: Duration,
    max_frame_size: usize,
}

impl Transport {
    /// Create a new transport presenting the identity of `tls`
    pub fn new(tls: TlsContext, connect_timeout: Duration, max_frame_size: usize) -> Self {
        Self {
            tls,
            known_peers: RwLock::new(HashMap::new()),
            connect_timeout,
            max_frame_size,
        }
    }

    /// Add a known peer and pin its certificate
    pub fn add_peer(&self, peer: PeerInfo) {
        self.tls.pin(peer.node_id, peer.tls_certificate.clone());
        self.known_peers.write().insert(peer.node_id, peer);
    }

    /// Get a known peer
    pub fn get_peer(&self, id: NodeId) -> Option<PeerInfo> {
        self.known_peers.read().get(&id).cloned()
    }

    /// All known peers, ordered by node id
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self.known_peers.read().values().cloned().collect();
        peers.sort_by_key(|p| p.node_id);
        peers
    }

    /// Dial a known peer and authenticate it by its pinned certificate
    pub async fn connect(&self, id: NodeId) -> Result<PeerConnection, TransportError> {
        let peer = self.get_peer(id).ok_or(TransportError::PeerNotFound(id))?;
        debug!("Dialing {}", peer);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer.addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout(peer.addr))??;
        stream.set_nodelay(true)?;

        let connector = self.tls.connector(&peer.tls_certificate)?;
        let server_name = ServerName::from(peer.addr.ip());
        let stream = tokio::time::timeout(
            self.connect_timeout,
            connector.connect(server_name, stream),
        )
        .await
        .map_err(|_| TransportError::HandshakeTimeout(peer.addr))??;
        Ok(PeerConnection::from_tls(
            TlsStream::Client(stream),
            self.max_frame_size,
            peer.addr,
            id,
        ))
    }

    /// Bind the gossip listener
    pub async fn bind(&self, addr: SocketAddr) -> Result<TcpListener, TransportError> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Accept one inbound TCP stream; [`secure_inbound`](Self::secure_inbound)
    /// completes it
    pub async fn accept(
        &self,
        listener: &TcpListener,
    ) -> Result<(TcpStream, SocketAddr), TransportError> {
        let (stream, addr) = listener.accept().await?;
        debug!("Accepted connection from {}", addr);
        Ok((stream, addr))
    }

    /// Run the TLS handshake of an accepted stream. Only pinned roster
    /// certificates complete it.
    pub async fn secure_inbound(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<PeerConnection, TransportError> {
        stream.set_nodelay(true)?;
        let stream = tokio::time::timeout(self.connect_timeout, self.tls.acceptor().accept(stream))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(addr))??;
        let peer = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(|certificate| self.tls.node_of(certificate.as_ref()))
            .ok_or(TransportError::UnpinnedCertificate(addr))?;
        debug!("Authenticated {} at {}", peer, addr);
        Ok(PeerConnection::from_tls(
            TlsStream::Server(stream),
            self.max_frame_size,
            addr,
            peer,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Hello, TipKnowledge};
    use crate::tls::testing;

    #[tokio::test]
    async fn test_duplex_exchange() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = Connection::new(a);
        let mut right = Connection::new(b);

        let hello = Message::Hello(Hello {
            protocol_version: 1,
            roster_digest: [0; 32],
            node_id: NodeId(1),
        });
        left.send(&hello).await.unwrap();
        assert_eq!(right.recv().await.unwrap(), hello);

        right.send(&Message::Ping).await.unwrap();
        assert_eq!(left.recv().await.unwrap(), Message::Ping);
    }

    async fn exchange(conn: &mut Connection<tokio::io::DuplexStream>, batch: &[Message]) -> usize {
        let (reader, writer) = conn.split_mut();
        let send = writer.send_all(batch);
        let recv = async {
            let mut received = 0;
            while received < batch.len() {
                reader.recv().await?;
                received += 1;
            }
            Ok::<_, TransportError>(received)
        };
        let (sent, received) = tokio::join!(send, recv);
        sent.unwrap();
        received.unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_halves_do_not_deadlock() {
        // Buffer much smaller than the data each side writes
        let (a, b) = tokio::io::duplex(64);
        let mut left = Connection::new(a);
        let mut right = Connection::new(b);

        let batch: Vec<Message> = (0..50)
            .map(|_| {
                Message::TipKnowledge(TipKnowledge {
                    known: vec![true; 100],
                })
            })
            .collect();

        let (l, r) = tokio::join!(
            exchange(&mut left, &batch),
            exchange(&mut right, &batch)
        );
        assert_eq!((l, r), (50, 50));
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = Connection::new(a);
        drop(b);
        assert!(matches!(
            left.recv().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    fn transport(identity: usize) -> Transport {
        let tls = TlsContext::new(testing::identity(identity)).unwrap();
        Transport::new(tls, Duration::from_secs(5), 1024 * 1024)
    }

    fn info(id: u64, addr: SocketAddr, identity: usize) -> PeerInfo {
        let certificate = testing::identity(identity).certificate().to_vec();
        PeerInfo::new(NodeId(id), addr, [id as u8; 32], certificate)
    }

    #[tokio::test]
    async fn test_connect_unknown_peer() {
        assert!(matches!(
            transport(0).connect(NodeId(3)).await,
            Err(TransportError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_tls_dial_and_accept() {
        let dialer = transport(1);
        let listener_side = transport(2);
        let listener = listener_side.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        dialer.add_peer(info(2, addr, 2));
        listener_side.add_peer(info(1, "127.0.0.1:1".parse().unwrap(), 1));

        let accept = async {
            let (stream, from) = listener_side.accept(&listener).await?;
            listener_side.secure_inbound(stream, from).await
        };
        let (dialed, accepted) = tokio::join!(dialer.connect(NodeId(2)), accept);
        let mut dialed = dialed.unwrap();
        let mut accepted = accepted.unwrap();
        assert_eq!(dialed.authenticated_peer(), Some(NodeId(2)));
        assert_eq!(accepted.authenticated_peer(), Some(NodeId(1)));

        dialed.send(&Message::Ping).await.unwrap();
        assert_eq!(accepted.recv().await.unwrap(), Message::Ping);
        accepted.send(&Message::Pong).await.unwrap();
        assert_eq!(dialed.recv().await.unwrap(), Message::Pong);
        assert!(accepted.remote_addr().is_some());
    }

    #[tokio::test]
    async fn test_unpinned_client_is_rejected() {
        let stranger = transport(3);
        let listener_side = transport(2);
        let listener = listener_side.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        stranger.add_peer(info(2, addr, 2));
        // The listener only knows node 1
        listener_side.add_peer(info(1, "127.0.0.1:1".parse().unwrap(), 1));

        let accept = async {
            let (stream, from) = listener_side.accept(&listener).await?;
            listener_side.secure_inbound(stream, from).await
        };
        let dial = async {
            let mut conn = stranger.connect(NodeId(2)).await?;
            conn.send(&Message::Ping).await?;
            conn.recv().await
        };
        let (dialed, accepted) = tokio::join!(dial, accept);
        assert!(accepted.is_err());
        assert!(dialed.is_err());
    }

    #[tokio::test]
    async fn test_server_must_present_pinned_certificate() {
        let dialer = transport(1);
        // Listens as identity 3 while the dialer expects identity 2
        let impostor = transport(3);
        let listener = impostor.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        dialer.add_peer(info(2, addr, 2));
        impostor.add_peer(info(1, "127.0.0.1:1".parse().unwrap(), 1));

        let accept = async {
            let (stream, from) = impostor.accept(&listener).await?;
            impostor.secure_inbound(stream, from).await
        };
        let (dialed, _) = tokio::join!(dialer.connect(NodeId(2)), accept);
        assert!(matches!(dialed, Err(TransportError::Io(_))));
    }
}

//! QUIC message channel
//!
//! Uses Quinn for QUIC protocol support. Each connection carries one
//! length-prefixed unidirectional stream per direction for reliable messages,
//! which keeps them in order. Unreliable messages go out as datagrams when they
//! fit and fall back to the stream otherwise.

use crate::channel::{ChannelEvent, ConnectionId, EventReceiver, EventSender, MessageChannel};
use crate::protocol::{FramedCodec, MessageStats};
use crate::NetworkError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use quinn::{congestion, ClientConfig, Connection, Endpoint, SendStream, ServerConfig, VarInt};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

/// ALPN protocol identifier for meshstream
const ALPN_MESHSTREAM: &[u8] = b"meshstream/1";

/// Bytes requested from the receive stream per read
const READ_CHUNK: usize = 64 * 1024;

/// Configuration for transport layer
#[derive(Debug, Clone)]
pub struct StreamTransportConfig {
    /// Keep-alive interval
    pub keep_alive_interval: Duration,
    /// Maximum idle timeout before closing connection
    pub max_idle_timeout: Duration,
    /// Initial congestion window in bytes
    pub initial_window: u64,
    /// Stream receive window
    pub stream_receive_window: VarInt,
}

impl Default for StreamTransportConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(5),
            max_idle_timeout: Duration::from_secs(30),
            initial_window: 128 * 1200,
            // Enough for a few chunks of 48 KiB in flight
            stream_receive_window: VarInt::from_u32(1024 * 1024),
        }
    }
}

struct QuicPeer {
    connection: Connection,
    send: Arc<Mutex<SendStream>>,
}

type PeerMap = Arc<parking_lot::Mutex<HashMap<ConnectionId, QuicPeer>>>;

/// Message channel over QUIC, either listening or connected to one server
pub struct QuicChannel {
    endpoint: Endpoint,
    peers: PeerMap,
    events: EventSender,
    stats: Arc<parking_lot::Mutex<MessageStats>>,
    ids: Arc<AtomicU64>,
    listening: bool,
}

impl QuicChannel {
    /// Bind a listening endpoint with a fresh self-signed certificate and
    /// start accepting connections.
    pub async fn listen(
        bind_addr: SocketAddr,
        config: StreamTransportConfig,
    ) -> Result<(Self, EventReceiver), NetworkError> {
        let server_config = create_server_config(&config)?;
        let endpoint = Endpoint::server(server_config, bind_addr).map_err(|e| {
            NetworkError::TransportError(format!("Failed to create server endpoint: {e}"))
        })?;

        let (channel, rx) = Self::with_endpoint(endpoint, true);
        let _ = channel.events.send(ChannelEvent::ServerInitialized);
        info!("Listening on {:?}", channel.endpoint.local_addr().ok());

        let accept = channel.handle();
        tokio::spawn(async move {
            while let Some(incoming) = accept.endpoint.accept().await {
                let handle = accept.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => {
                            if let Err(e) = handle.register(connection).await {
                                warn!("Failed to set up incoming connection: {e}");
                            }
                        }
                        Err(e) => warn!("Incoming connection failed: {e}"),
                    }
                });
            }
            debug!("Accept loop finished");
        });

        Ok((channel, rx))
    }

    /// Connect to a listening endpoint
    pub async fn connect(
        addr: SocketAddr,
        config: StreamTransportConfig,
    ) -> Result<(Self, EventReceiver), NetworkError> {
        let bind: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let endpoint = Endpoint::client(bind).map_err(|e| {
            NetworkError::TransportError(format!("Failed to create endpoint: {e}"))
        })?;

        let connection = endpoint
            .connect_with(create_client_config(&config)?, addr, "localhost")
            .map_err(|e| {
                NetworkError::ConnectionFailed(format!("Failed to initiate connection: {e}"))
            })?
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("Connection failed: {e}")))?;

        let (channel, rx) = Self::with_endpoint(endpoint, false);
        channel.handle().register(connection).await?;
        Ok((channel, rx))
    }

    fn with_endpoint(endpoint: Endpoint, listening: bool) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let channel = Self {
            endpoint,
            peers: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            events,
            stats: Arc::new(parking_lot::Mutex::new(MessageStats::default())),
            ids: Arc::new(AtomicU64::new(1)),
            listening,
        };
        (channel, rx)
    }

    fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            endpoint: self.endpoint.clone(),
            peers: Arc::clone(&self.peers),
            events: self.events.clone(),
            stats: Arc::clone(&self.stats),
            ids: Arc::clone(&self.ids),
        }
    }

    /// Get the bound address
    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.endpoint
            .local_addr()
            .map_err(|e| NetworkError::TransportError(format!("Failed to get local address: {e}")))
    }
}

/// State shared with the accept and reader tasks
#[derive(Clone)]
struct ChannelHandle {
    endpoint: Endpoint,
    peers: PeerMap,
    events: EventSender,
    stats: Arc<parking_lot::Mutex<MessageStats>>,
    ids: Arc<AtomicU64>,
}

impl ChannelHandle {
    async fn register(&self, connection: Connection) -> Result<ConnectionId, NetworkError> {
        let send = connection
            .open_uni()
            .await
            .map_err(|e| NetworkError::TransportError(format!("Failed to open stream: {e}")))?;

        let id = ConnectionId(self.ids.fetch_add(1, Ordering::Relaxed));
        info!("Connection {id} established with {}", connection.remote_address());
        self.peers.lock().insert(
            id,
            QuicPeer {
                connection: connection.clone(),
                send: Arc::new(Mutex::new(send)),
            },
        );
        let _ = self.events.send(ChannelEvent::Connected(id));

        tokio::spawn(self.clone().read_datagrams(id, connection.clone()));
        tokio::spawn(self.clone().read_stream(id, connection));
        Ok(id)
    }

    async fn read_stream(self, id: ConnectionId, connection: Connection) {
        let result = async {
            let mut recv = connection
                .accept_uni()
                .await
                .map_err(|e| NetworkError::TransportError(format!("Failed to accept stream: {e}")))?;
            let mut buf = BytesMut::new();
            loop {
                let chunk = recv
                    .read_chunk(READ_CHUNK, true)
                    .await
                    .map_err(|e| NetworkError::TransportError(format!("Read failed: {e}")))?;
                let Some(chunk) = chunk else {
                    return Ok::<(), NetworkError>(());
                };
                buf.extend_from_slice(&chunk.bytes);
                while let Some(payload) = FramedCodec::decode(&mut buf)? {
                    self.deliver(id, payload);
                }
            }
        }
        .await;

        if let Err(e) = result {
            debug!("Stream from {id} ended: {e}");
        }
        if self.peers.lock().remove(&id).is_some() {
            info!("Connection {id} closed");
            let _ = self.events.send(ChannelEvent::Disconnected(id));
        }
    }

    async fn read_datagrams(self, id: ConnectionId, connection: Connection) {
        while let Ok(payload) = connection.read_datagram().await {
            self.deliver(id, payload);
        }
    }

    fn deliver(&self, id: ConnectionId, payload: Bytes) {
        trace!("Received {} bytes from {id}", payload.len());
        self.stats.lock().record_received(payload.len());
        let _ = self.events.send(ChannelEvent::Message(id, payload));
    }
}

#[async_trait]
impl MessageChannel for QuicChannel {
    async fn send(
        &self,
        connection: ConnectionId,
        payload: Bytes,
        reliable: bool,
    ) -> Result<(), NetworkError> {
        let (conn, send) = {
            let peers = self.peers.lock();
            let peer = peers
                .get(&connection)
                .ok_or(NetworkError::NotConnected(connection))?;
            (peer.connection.clone(), Arc::clone(&peer.send))
        };
        let len = payload.len();

        let fits_datagram = conn.max_datagram_size().is_some_and(|max| len <= max);
        if !reliable && fits_datagram {
            conn.send_datagram(payload)
                .map_err(|e| NetworkError::TransportError(format!("Datagram failed: {e}")))?;
        } else {
            let mut buf = BytesMut::with_capacity(4 + len);
            FramedCodec::encode(&payload, &mut buf)?;
            send.lock()
                .await
                .write_all(&buf)
                .await
                .map_err(|e| NetworkError::TransportError(format!("Write failed: {e}")))?;
        }

        self.stats.lock().record_sent(len);
        Ok(())
    }

    fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.peers.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    async fn disconnect(&self, connection: ConnectionId) {
        let peer = self.peers.lock().remove(&connection);
        if let Some(peer) = peer {
            // Let queued reliable messages reach the peer before closing
            let _ = peer.send.lock().await.finish();
            peer.connection.close(VarInt::from_u32(0), b"disconnect");
            let _ = self.events.send(ChannelEvent::Disconnected(connection));
        }
    }

    async fn close(&self) {
        for connection in self.connections() {
            self.disconnect(connection).await;
        }
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
        if self.listening {
            let _ = self.events.send(ChannelEvent::ServerClosed);
        }
        self.endpoint.wait_idle().await;
    }

    fn stats(&self) -> MessageStats {
        self.stats.lock().clone()
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Create client configuration
fn create_client_config(config: &StreamTransportConfig) -> Result<ClientConfig, NetworkError> {
    let provider = crypto_provider();
    // Senders use throwaway self-signed certificates
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| NetworkError::TransportError(format!("Failed to select TLS version: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth();

    client_crypto.alpn_protocols = vec![ALPN_MESHSTREAM.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto).map_err(|e| {
            NetworkError::TransportError(format!("Failed to create QUIC client config: {e}"))
        })?,
    ));

    client_config.transport_config(Arc::new(create_transport_config(config)?));

    Ok(client_config)
}

/// Create server configuration with self-signed certificate
fn create_server_config(config: &StreamTransportConfig) -> Result<ServerConfig, NetworkError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).map_err(|e| {
        NetworkError::TransportError(format!("Failed to generate certificate: {e}"))
    })?;

    let cert_der = CertificateDer::from(cert.cert);
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| NetworkError::TransportError(format!("Failed to select TLS version: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .map_err(|e| {
            NetworkError::TransportError(format!("Failed to create server crypto config: {e}"))
        })?;

    server_crypto.alpn_protocols = vec![ALPN_MESHSTREAM.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto).map_err(|e| {
            NetworkError::TransportError(format!("Failed to create QUIC server config: {e}"))
        })?,
    ));

    server_config.transport_config(Arc::new(create_transport_config(config)?));

    Ok(server_config)
}

/// Create QUIC transport configuration
fn create_transport_config(
    config: &StreamTransportConfig,
) -> Result<quinn::TransportConfig, NetworkError> {
    let mut transport = quinn::TransportConfig::default();

    let idle = config
        .max_idle_timeout
        .try_into()
        .map_err(|e| NetworkError::TransportError(format!("Invalid idle timeout: {e}")))?;
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(Some(config.keep_alive_interval));

    transport.initial_rtt(Duration::from_millis(100));

    // Set flow control windows
    transport.stream_receive_window(config.stream_receive_window);
    transport.receive_window(config.stream_receive_window);

    let mut cc_config = congestion::BbrConfig::default();
    cc_config.initial_window(config.initial_window);
    transport.congestion_controller_factory(Arc::new(cc_config));

    Ok(transport)
}

/// Accepts any server certificate while still checking handshake signatures
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

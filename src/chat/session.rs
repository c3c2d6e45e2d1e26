//! Chat channel: handshake driver and encrypted session traffic.
//!
//! [`open`] finds the peer, runs the handshake and returns a [`Channel`].
//! Session messages are JSON values encrypted with the session key and
//! written as lowercase hex text, one message per write. A background task
//! reads, decrypts and parses incoming messages and hands them to the
//! message callback. The close callback fires exactly once, whether the
//! peer hangs up, [`Channel::close`] is called or the channel is dropped.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::chat::config::{ChatConfig, OPENING_TIMEOUT};
use crate::chat::error::ChatError;
use crate::chat::protocol::{ControlPacket, Handshake, PacketStream, Role, Step};
use crate::chat::transport::{rendezvous, resolve, Connection, FrameReader, FrameTransport, FrameWriter};
use crate::crypto::{KeyStore, SessionCipher};

/// The message shape used by the command line chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Connect to the peer described by `config` and establish a session.
///
/// `keys` supplies the identity and any known foreign key; each call works
/// on a fresh session key. A missing `on_message` is rejected before any
/// network activity.
pub async fn open<M, C>(
    config: &ChatConfig,
    keys: &KeyStore,
    on_message: Option<M>,
    on_close: C,
) -> Result<Channel, ChatError>
where
    M: FnMut(Value) + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    let on_message =
        on_message.ok_or_else(|| ChatError::Config("a message callback is required".to_string()))?;
    config.validate()?;

    let peer = resolve(&config.remote_address, config.remote_port, config.local_port).await?;
    let (mut connection, role) = rendezvous(&peer).await?;
    info!(%role, peer = %peer.remote(), "starting handshake");

    let handshake = negotiate_within(
        &mut connection,
        Handshake::new(keys.for_new_session(), role),
        config.opening_timeout,
    )
    .await?;
    let channel = Channel::start(connection, handshake, on_message, on_close)?;

    if let Some(path) = &config.save_foreign_key {
        match crate::crypto::persist_foreign_key(channel.peer_key(), path, config.profile.as_deref()) {
            Ok(()) => info!(path = %path.display(), "saved peer public key"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to save peer public key"),
        }
    }

    Ok(channel)
}

/// Run the handshake to completion over `transport`.
///
/// The acceptor speaks first. Bytes that arrive behind the packet that
/// completes the handshake are pushed back into the transport so they are
/// read as the first session frame. On failure the final reply, if any, is
/// sent and the transport is closed.
pub async fn negotiate<T>(transport: &mut T, handshake: Handshake) -> Result<Handshake, ChatError>
where
    T: FrameTransport + ?Sized,
{
    negotiate_within(transport, handshake, OPENING_TIMEOUT).await
}

/// [`negotiate`] with an explicit wait for the acceptor's opening packet.
pub async fn negotiate_within<T>(
    transport: &mut T,
    mut handshake: Handshake,
    opening_timeout: Duration,
) -> Result<Handshake, ChatError>
where
    T: FrameTransport + ?Sized,
{
    let mut pending = match handshake.role() {
        Role::Acceptor => {
            let first = handshake.start()?;
            send_packet(transport, &first).await?;
            None
        }
        Role::Connector => await_opening(transport, &mut handshake, opening_timeout).await?,
    };

    loop {
        let frame = match pending.take() {
            Some(frame) => frame,
            None => transport
                .recv_frame()
                .await?
                .ok_or(ChatError::ConnectionClosed)?,
        };

        let mut packets = PacketStream::new(&frame);
        while let Some(packet) = packets.next() {
            let packet = match packet {
                Ok(packet) => packet,
                Err(e) => {
                    let _ = transport.close().await;
                    return Err(e);
                }
            };

            match handshake.handle(packet) {
                Step::Send(reply) => send_packet(transport, &reply).await?,
                Step::Established(reply) => {
                    if let Some(reply) = reply {
                        send_packet(transport, &reply).await?;
                    }
                    let rest = packets.remainder();
                    if !rest.is_empty() {
                        transport.unread(rest.to_vec());
                    }
                    info!(role = %handshake.role(), "session established");
                    return Ok(handshake);
                }
                Step::Failed { reply, error } => {
                    if let Some(reply) = reply {
                        let _ = send_packet(transport, &reply).await;
                    }
                    let _ = transport.close().await;
                    warn!(error = %error, "handshake failed");
                    return Err(error);
                }
            }
        }
    }
}

/// Wait for the acceptor's first frame.
///
/// When both ends dial at the same moment the TCP connection still opens,
/// but each end is a connector and neither speaks. After `wait` of silence
/// the end with the lower address opens the handshake itself; the other
/// end waits once more and then gives up.
async fn await_opening<T>(
    transport: &mut T,
    handshake: &mut Handshake,
    wait: Duration,
) -> Result<Option<Vec<u8>>, ChatError>
where
    T: FrameTransport + ?Sized,
{
    if let Ok(frame) = timeout(wait, transport.recv_frame()).await {
        return frame?.map(Some).ok_or(ChatError::ConnectionClosed);
    }

    if opens_after_silence(transport.endpoints()) {
        info!("peer did not open the handshake, opening it here");
        let first = handshake.take_initiative()?;
        send_packet(transport, &first).await?;
        return Ok(None);
    }

    match timeout(wait, transport.recv_frame()).await {
        Ok(frame) => frame?.map(Some).ok_or(ChatError::ConnectionClosed),
        Err(_) => {
            let _ = transport.close().await;
            warn!(?wait, "peer never opened the handshake");
            Err(ChatError::Connection("peer never opened the handshake".to_string()))
        }
    }
}

/// Both ends see the same address pair, mirrored, so exactly one of them
/// is lower. Without addresses neither end opens.
fn opens_after_silence(endpoints: Option<(SocketAddr, SocketAddr)>) -> bool {
    let rank = |addr: SocketAddr| (addr.ip().to_canonical(), addr.port());
    endpoints
        .map(|(local, peer)| rank(local) < rank(peer))
        .unwrap_or(false)
}

async fn send_packet<T>(transport: &mut T, packet: &ControlPacket) -> Result<(), ChatError>
where
    T: FrameTransport + ?Sized,
{
    debug!(packet = packet.name(), "sending control packet");
    transport.send_frame(&packet.to_bytes()?).await
}

type CloseCallback = Box<dyn FnOnce() + Send>;

/// Fires the close callback at most once.
struct CloseNotifier {
    callback: Mutex<Option<CloseCallback>>,
}

impl CloseNotifier {
    fn new(callback: CloseCallback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    fn fire(&self) {
        let callback = match self.callback.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// An established, encrypted chat channel.
///
/// The close callback fires once: when the peer hangs up, on
/// [`Channel::close`], or when the channel is dropped, whichever comes first.
pub struct Channel {
    writer: FrameWriter,
    cipher: SessionCipher,
    role: Role,
    peer_key: RsaPublicKey,
    learned_peer_key: bool,
    closer: Arc<CloseNotifier>,
    reader: JoinHandle<()>,
}

impl Channel {
    /// Start session traffic on a connection whose handshake is complete.
    pub fn start<M, C>(
        connection: Connection,
        handshake: Handshake,
        on_message: M,
        on_close: C,
    ) -> Result<Self, ChatError>
    where
        M: FnMut(Value) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let role = handshake.role();
        let learned_peer_key = handshake.learned_peer_key();
        let mut keys = handshake.into_keys();

        let cipher = keys
            .take_session_cipher()
            .ok_or_else(|| ChatError::SessionKey("handshake finished without a session key".to_string()))?;
        let peer_key = keys
            .foreign_key()
            .cloned()
            .ok_or_else(|| ChatError::Protocol("handshake finished without a peer key".to_string()))?;

        let (reader, writer) = connection.into_split();
        let closer = Arc::new(CloseNotifier::new(Box::new(on_close)));
        let reader = tokio::spawn(read_loop(reader, cipher.clone(), on_message, Arc::clone(&closer)));

        Ok(Self {
            writer,
            cipher,
            role,
            peer_key,
            learned_peer_key,
            closer,
            reader,
        })
    }

    /// Encrypt and send one JSON-serializable message.
    pub async fn send<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<(), ChatError> {
        let json = serde_json::to_string(message).map_err(|e| ChatError::Protocol(e.to_string()))?;
        let sealed = self.cipher.encrypt_to_hex(&json);
        debug!(bytes = sealed.len(), "sending session message");
        self.writer.write_frame(sealed.as_bytes()).await
    }

    /// Close the connection and fire the close callback.
    pub async fn close(&mut self) -> Result<(), ChatError> {
        let result = self.writer.shutdown().await;
        self.reader.abort();
        self.closer.fire();
        result
    }

    /// Which end of the TCP connection we are.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The peer's verified public key.
    pub fn peer_key(&self) -> &RsaPublicKey {
        &self.peer_key
    }

    /// Whether the peer's key was received during this handshake.
    pub fn learned_peer_key(&self) -> bool {
        self.learned_peer_key
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader.abort();
        self.closer.fire();
    }
}

async fn read_loop<M>(mut reader: FrameReader, cipher: SessionCipher, mut on_message: M, closer: Arc<CloseNotifier>)
where
    M: FnMut(Value) + Send,
{
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => match open_message(&cipher, &frame) {
                Ok(message) => on_message(message),
                Err(e) => warn!(error = %e, "dropping unreadable session message"),
            },
            Ok(None) => {
                debug!("peer closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "session read failed");
                break;
            }
        }
    }
    closer.fire();
}

fn open_message(cipher: &SessionCipher, frame: &[u8]) -> Result<Value, ChatError> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| ChatError::Protocol("session frame is not text".to_string()))?;
    let json = cipher.decrypt_hex(text.trim())?;
    serde_json::from_str(&json).map_err(|e| ChatError::Protocol(format!("invalid message JSON: {}", e)))
}

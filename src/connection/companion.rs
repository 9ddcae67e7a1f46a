//! Companion Link connection state machine (§4.8): a single TCP socket,
//! plaintext-framed pair-verify, then `E_OPACK`-encrypted compact-pack
//! request/response traffic tagged with `_i`/`_x`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};

use crate::error::MrpError;
use crate::net::Runtime;
use crate::protocol::companion::{CompanionFrame, CompanionSession, FrameType};
use crate::protocol::compact_pack::{self, Value};
use crate::protocol::pairing::{
    Credential, CredentialHalf, PairSetup, PairVerify, PairVerifyVariant, SessionKeys, SetupStepResult,
    VerifyStepResult,
};
use crate::types::{AppleTvDevice, ClientConfig};

use super::state::{ConnectionEvent, ConnectionState, DisconnectReason};

/// Compact-pack key carrying the raw TLV8 pairing record (§6).
const PAIRING_DATA_KEY: &str = "_pd";
/// Compact-pack key naming the pair-setup flavor; `PAIR_SETUP_TYPE_PIN` (1 =
/// PIN) is the only value this client sends.
const PAIR_SETUP_TYPE_KEY: &str = "_pwTy";
const PAIR_SETUP_TYPE_PIN: i64 = 1;
/// Compact-pack key naming the pair-verify auth flavor; 4 = pair-verify
/// over Companion.
const PAIR_VERIFY_TYPE_KEY: &str = "_auTy";
const PAIR_VERIFY_AUTH_TYPE: i64 = 4;
/// Compact-pack key carrying pair-setup's monotonic transfer identifier.
const TRANSFER_ID_KEY: &str = "_x";

struct CompanionChannelHandle {
    outbound: mpsc::Sender<Value>,
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Value>>>>;

/// A Companion Link connection to one device. Independent of
/// [`super::manager::ConnectionManager`]; many devices expose both an
/// AirPlay control channel and a Companion channel, paired separately.
pub struct CompanionConnection {
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    channel: Mutex<Option<CompanionChannelHandle>>,
    pending: PendingMap,
    event_tx: broadcast::Sender<ConnectionEvent>,
    inbound_tx: broadcast::Sender<Value>,
    next_transfer_id: AtomicI64,
}

impl CompanionConnection {
    /// Create a new, disconnected Companion connection.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        let (inbound_tx, _) = broadcast::channel(64);
        Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            channel: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
            inbound_tx,
            next_transfer_id: AtomicI64::new(1),
        }
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Subscribe to connection lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Subscribe to inbound compact-pack maps that did not match a
    /// pending request's transfer id (unsolicited server events).
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<Value> {
        self.inbound_tx.subscribe()
    }

    async fn set_state(&self, new: ConnectionState) {
        let old = {
            let mut guard = self.state.write().await;
            let old = *guard;
            *guard = new;
            old
        };
        if old != new {
            let _ = self.event_tx.send(ConnectionEvent::StateChanged { old, new });
        }
    }

    /// Run Companion Link pair-setup (PIN-based) against `device`,
    /// producing a durable credential. Independent of the device's
    /// AirPlay pairing: a device may require pairing each transport
    /// separately (§4.5, §4.8).
    ///
    /// # Errors
    ///
    /// Returns an error if the device has no Companion Link port, the TCP
    /// connection fails, or the handshake is rejected.
    pub async fn pair_setup(
        &self,
        device: &AppleTvDevice,
        client_identifier: String,
        pin: &str,
    ) -> Result<Credential, MrpError> {
        let port = device
            .companion_port
            .ok_or_else(|| MrpError::Configuration("device has no Companion Link port".into()))?;
        let addr = device
            .address()
            .ok_or_else(|| MrpError::Configuration("device has no usable address".into()))?;

        let mut stream = Runtime::timeout(self.config.pairing_timeout, TcpStream::connect((addr, port))).await??;

        run_companion_pair_setup(&mut stream, client_identifier, pin).await
    }

    /// Establish a Companion connection using a previously stored
    /// Companion credential half.
    ///
    /// # Errors
    ///
    /// Returns an error if the device has no Companion port, the TCP
    /// connection fails, or pair-verify fails.
    pub async fn connect(&self, device: &AppleTvDevice, credential: &CredentialHalf) -> Result<(), MrpError> {
        {
            let current = *self.state.read().await;
            if current.is_active() || current.is_ready() {
                return Err(MrpError::Configuration("companion connection already active".into()));
            }
        }

        let port = device
            .companion_port
            .ok_or_else(|| MrpError::Configuration("device has no Companion Link port".into()))?;
        let addr = device
            .address()
            .ok_or_else(|| MrpError::Configuration("device has no usable address".into()))?;

        self.set_state(ConnectionState::TcpOpen).await;
        let mut stream = Runtime::timeout(self.config.pairing_timeout, TcpStream::connect((addr, port))).await??;

        self.set_state(ConnectionState::VerifyInProgress).await;
        let keys = Runtime::timeout(self.config.pairing_timeout, run_companion_pair_verify(&mut stream, credential))
            .await??;

        let session = CompanionSession::new(&keys.write_key, &keys.read_key)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        *self.channel.lock().await = Some(CompanionChannelHandle { outbound: outbound_tx });

        tokio::spawn(run_companion_channel(
            stream,
            session,
            outbound_rx,
            Arc::clone(&self.pending),
            self.inbound_tx.clone(),
            Arc::clone(&self.state),
            device.clone(),
            self.event_tx.clone(),
        ));

        self.set_state(ConnectionState::Ready).await;
        let _ = self.event_tx.send(ConnectionEvent::Connected { device: device.clone() });
        Ok(())
    }

    /// Send a request tagged with a fresh transfer id and `identifier`,
    /// merging in any fields from `params` (which must be a `Value::Map`
    /// or `Value::Null`), and wait for the matching reply.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection is established, the channel has
    /// closed, or the reply does not arrive within the configured
    /// request timeout.
    pub async fn request(&self, identifier: impl Into<String>, params: Value) -> Result<Value, MrpError> {
        let transfer_id = self.next_transfer_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = vec![
            (Value::String("_i".to_string()), Value::String(identifier.into())),
            (Value::String("_x".to_string()), Value::Int(transfer_id)),
        ];
        if let Value::Map(extra) = params {
            entries.extend(extra);
        }
        let message = Value::Map(entries);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(transfer_id, reply_tx);

        let send_result = {
            let guard = self.channel.lock().await;
            match guard.as_ref() {
                Some(handle) => handle.outbound.send(message).await,
                None => {
                    drop(guard);
                    self.pending.lock().await.remove(&transfer_id);
                    return Err(MrpError::Configuration("companion connection not established".into()));
                }
            }
        };
        if send_result.is_err() {
            self.pending.lock().await.remove(&transfer_id);
            return Err(MrpError::Transport("companion channel closed".into()));
        }

        match Runtime::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(MrpError::Transport("companion channel closed before reply".into())),
            Err(_) => {
                self.pending.lock().await.remove(&transfer_id);
                Err(MrpError::Timeout)
            }
        }
    }

    /// Tear down the connection. The background channel task exits once
    /// it observes the outbound sender has been dropped.
    pub async fn disconnect(&self) {
        *self.channel.lock().await = None;
        self.set_state(ConnectionState::Disconnected).await;
    }
}

async fn run_companion_pair_verify<S>(stream: &mut S, credential: &CredentialHalf) -> Result<SessionKeys, MrpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pair_verify = PairVerify::new(PairVerifyVariant::Companion, credential)?;
    let mut buf = Vec::new();
    let auth_type = vec![(Value::String(PAIR_VERIFY_TYPE_KEY.to_string()), Value::Int(PAIR_VERIFY_AUTH_TYPE))];

    let m1 = pair_verify.start()?;
    write_companion_pairing_frame(stream, &m1, auth_type.clone()).await?;
    let payload = read_companion_pairing_frame(stream, &mut buf).await?;

    let VerifyStepResult::SendData(m3) = pair_verify.process_m2(&payload)? else {
        return Err(MrpError::ProtocolViolation("companion pair-verify did not produce M3".into()));
    };
    write_companion_pairing_frame(stream, &m3, auth_type).await?;
    let payload = read_companion_pairing_frame(stream, &mut buf).await?;

    let VerifyStepResult::Complete(keys) = pair_verify.process_m4(&payload)? else {
        return Err(MrpError::ProtocolViolation("companion pair-verify did not complete".into()));
    };

    Ok(keys)
}

/// Run pair-setup (PIN-based, SRP) over the Companion framed transport:
/// each TLV message is wrapped in a compact-pack envelope and carried in
/// a `PairingData` frame (§4.5), distinguished from pair-verify's envelope
/// by `_pwTy` (pairing type) instead of `_auTy`, plus a monotonic `_x`
/// transfer identifier.
async fn run_companion_pair_setup<S>(stream: &mut S, client_identifier: String, pin: &str) -> Result<Credential, MrpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pair_setup = PairSetup::new(client_identifier);
    pair_setup.set_pin(pin);
    let mut buf = Vec::new();
    let mut transfer_id: i64 = 1;

    let envelope_fields = |transfer_id: i64| {
        vec![
            (Value::String(PAIR_SETUP_TYPE_KEY.to_string()), Value::Int(PAIR_SETUP_TYPE_PIN)),
            (Value::String(TRANSFER_ID_KEY.to_string()), Value::Int(transfer_id)),
        ]
    };

    let m1 = pair_setup.start()?;
    write_companion_pairing_frame(stream, &m1, envelope_fields(transfer_id)).await?;
    let payload = read_companion_pairing_frame(stream, &mut buf).await?;
    transfer_id += 1;

    let SetupStepResult::SendData(m3) = pair_setup.step(Some(&payload))? else {
        return Err(MrpError::ProtocolViolation("companion pair-setup did not produce M3".into()));
    };
    write_companion_pairing_frame(stream, &m3, envelope_fields(transfer_id)).await?;
    let payload = read_companion_pairing_frame(stream, &mut buf).await?;
    transfer_id += 1;

    let SetupStepResult::SendData(m5) = pair_setup.step(Some(&payload))? else {
        return Err(MrpError::ProtocolViolation("companion pair-setup did not produce M5".into()));
    };
    write_companion_pairing_frame(stream, &m5, envelope_fields(transfer_id)).await?;
    let payload = read_companion_pairing_frame(stream, &mut buf).await?;

    let SetupStepResult::Complete(credential) = pair_setup.step(Some(&payload))? else {
        return Err(MrpError::ProtocolViolation("companion pair-setup did not complete".into()));
    };

    Ok(credential)
}

async fn write_companion_frame<S>(stream: &mut S, frame_type: FrameType, payload: &[u8]) -> Result<(), MrpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CompanionFrame::new(frame_type, payload.to_vec());
    stream.write_all(&frame.encode()).await?;
    Ok(())
}

/// Wrap a TLV8 pairing record in the compact-pack envelope (§4.5/§4.6/§6:
/// `{ "_pd": <tlv>, ...extra }`) and write it as a `PairingData` frame.
async fn write_companion_pairing_frame<S>(stream: &mut S, tlv: &[u8], extra: Vec<(Value, Value)>) -> Result<(), MrpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut entries = vec![(Value::String(PAIRING_DATA_KEY.to_string()), Value::Bytes(tlv.to_vec()))];
    entries.extend(extra);
    let envelope = compact_pack::encode(&Value::Map(entries));
    write_companion_frame(stream, FrameType::PairingData, &envelope).await
}

/// Read the next complete frame, buffering across reads in `buf`
/// (ciphertext-free: this is only used during the plaintext pairing
/// phase), decode its compact-pack envelope, and return the `_pd` TLV
/// bytes inside it.
async fn read_companion_pairing_frame<S>(stream: &mut S, buf: &mut Vec<u8>) -> Result<Vec<u8>, MrpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = read_companion_frame(stream, buf).await?;
    let envelope = compact_pack::decode(&payload)
        .map_err(|e| MrpError::ProtocolViolation(format!("malformed companion pairing envelope: {e}")))?;
    match envelope.get(PAIRING_DATA_KEY) {
        Some(Value::Bytes(tlv)) => Ok(tlv.clone()),
        _ => Err(MrpError::ProtocolViolation("companion pairing envelope missing _pd".into())),
    }
}

/// Read and return the payload of the next complete frame, buffering
/// across reads in `buf`.
async fn read_companion_frame<S>(stream: &mut S, buf: &mut Vec<u8>) -> Result<Vec<u8>, MrpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut read_buf = [0u8; 4096];
    loop {
        let (mut frames, consumed) = CompanionFrame::parse_all(buf);
        if !frames.is_empty() {
            buf.drain(..consumed);
            return Ok(frames.remove(0).payload);
        }
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Err(MrpError::Transport("companion connection closed during pairing".into()));
        }
        buf.extend_from_slice(&read_buf[..n]);
    }
}

async fn run_companion_channel(
    mut stream: TcpStream,
    mut session: CompanionSession,
    mut outbound: mpsc::Receiver<Value>,
    pending: PendingMap,
    inbound_tx: broadcast::Sender<Value>,
    state: Arc<RwLock<ConnectionState>>,
    device: AppleTvDevice,
    event_tx: broadcast::Sender<ConnectionEvent>,
) {
    let mut cipher_buf = Vec::new();
    let mut read_buf = [0u8; 4096];

    loop {
        tokio::select! {
            biased;

            outgoing = outbound.recv() => {
                let Some(message) = outgoing else {
                    break;
                };
                let plaintext = compact_pack::encode(&message);
                let frame = match session.encrypt(&plaintext) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("failed to encrypt companion message: {e}");
                        break;
                    }
                };
                if let Err(e) = stream.write_all(&frame.encode()).await {
                    tracing::warn!("failed to write companion frame: {e}");
                    break;
                }
            }

            read_result = stream.read(&mut read_buf) => {
                match read_result {
                    Ok(0) => {
                        *state.write().await = ConnectionState::Disconnected;
                        let _ = event_tx.send(ConnectionEvent::Disconnected {
                            device: device.clone(),
                            reason: DisconnectReason::NetworkError("companion channel closed".into()),
                        });
                        break;
                    }
                    Ok(n) => {
                        cipher_buf.extend_from_slice(&read_buf[..n]);
                        let (frames, consumed) = CompanionFrame::parse_all(&cipher_buf);
                        cipher_buf.drain(..consumed);
                        for frame in frames {
                            if frame.frame_type != FrameType::EOpack {
                                continue;
                            }
                            let plaintext = match session.decrypt(&frame) {
                                Ok(plaintext) => plaintext,
                                Err(e) => {
                                    tracing::warn!("companion channel decrypt failed: {e}");
                                    *state.write().await = ConnectionState::Disconnected;
                                    let _ = event_tx.send(ConnectionEvent::Disconnected {
                                        device: device.clone(),
                                        reason: DisconnectReason::AuthenticationFailed,
                                    });
                                    return;
                                }
                            };
                            let value = match compact_pack::decode(&plaintext) {
                                Ok(value) => value,
                                Err(e) => {
                                    tracing::warn!("dropping malformed companion payload: {e}");
                                    continue;
                                }
                            };
                            let transfer_id = match value.get("_x") {
                                Some(Value::Int(id)) => Some(*id),
                                _ => None,
                            };
                            let waiter = match transfer_id {
                                Some(id) => pending.lock().await.remove(&id),
                                None => None,
                            };
                            match waiter {
                                Some(sender) => {
                                    let _ = sender.send(value);
                                }
                                None => {
                                    let _ = inbound_tx.send(value);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("companion channel read failed: {e}");
                        *state.write().await = ConnectionState::Disconnected;
                        let _ = event_tx.send(ConnectionEvent::Disconnected {
                            device: device.clone(),
                            reason: DisconnectReason::NetworkError(e.to_string()),
                        });
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crypto::Ed25519KeyPair;
    use crate::testing::MockApplePeer;
    use tokio::io::AsyncWriteExt as _;

    fn client_half() -> CredentialHalf {
        let client_signing = Ed25519KeyPair::generate();
        let server_signing = Ed25519KeyPair::generate();
        CredentialHalf {
            client_identifier: "client-1".to_string(),
            client_long_term_private: client_signing.secret_bytes(),
            client_long_term_public: *client_signing.public_key().as_bytes(),
            server_long_term_public: *server_signing.public_key().as_bytes(),
            server_identifier: "server-1".to_string(),
        }
    }

    #[tokio::test]
    async fn pair_verify_sends_m1_as_a_compact_pack_wrapped_pairing_data_frame() {
        let (mut peer, mut client_stream) = MockApplePeer::pair(8192);
        let credential = client_half();

        let client_task =
            tokio::spawn(async move { run_companion_pair_verify(&mut client_stream, &credential).await });

        let header = peer.read_exact(4).await.expect("frame header");
        let frame_type = header[0];
        let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        assert_eq!(frame_type, FrameType::PairingData as u8);
        let payload = peer.read_exact(len).await.expect("frame payload");

        let envelope = compact_pack::decode(&payload).expect("valid compact-pack envelope");
        assert_eq!(envelope.get(PAIR_VERIFY_TYPE_KEY), Some(&Value::Int(PAIR_VERIFY_AUTH_TYPE)));
        let Some(Value::Bytes(tlv)) = envelope.get(PAIRING_DATA_KEY) else {
            panic!("envelope missing _pd bytes");
        };

        let tlv = crate::protocol::pairing::TlvDecoder::decode(tlv).expect("valid M1 TLV");
        assert_eq!(tlv.get_sequence().unwrap(), 1);

        // Closing the peer's write half without a reply forces the client's
        // read loop to observe EOF and fail cleanly rather than hang.
        drop(peer);
        let result = client_task.await.expect("task did not panic");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn pair_setup_sends_m1_wrapped_with_pwty_and_a_monotonic_transfer_id() {
        let (mut peer, mut client_stream) = MockApplePeer::pair(8192);

        let client_task = tokio::spawn(async move {
            run_companion_pair_setup(&mut client_stream, "client-1".to_string(), "1234").await
        });

        let header = peer.read_exact(4).await.expect("frame header");
        assert_eq!(header[0], FrameType::PairingData as u8);
        let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        let payload = peer.read_exact(len).await.expect("frame payload");

        let envelope = compact_pack::decode(&payload).expect("valid compact-pack envelope");
        assert_eq!(envelope.get(PAIR_SETUP_TYPE_KEY), Some(&Value::Int(PAIR_SETUP_TYPE_PIN)));
        assert_eq!(envelope.get(TRANSFER_ID_KEY), Some(&Value::Int(1)));
        let Some(Value::Bytes(tlv)) = envelope.get(PAIRING_DATA_KEY) else {
            panic!("envelope missing _pd bytes");
        };

        let tlv = crate::protocol::pairing::TlvDecoder::decode(tlv).expect("valid M1 TLV");
        assert_eq!(tlv.get_sequence().unwrap(), 1);

        drop(peer);
        let result = client_task.await.expect("task did not panic");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn disconnected_connection_rejects_requests() {
        let connection = CompanionConnection::new(ClientConfig::default());
        let result = connection.request("_getKeyboardSession", Value::Null).await;
        assert!(matches!(result, Err(MrpError::Configuration(_))));
    }
}

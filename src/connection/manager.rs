//! Connection state machine for the AirPlay control session (§4.7): one
//! TCP control channel secured by pair-verify, an event channel and a
//! data channel derived from the same shared secret, and the MRP init
//! dialogue run once on the data channel before steady-state traffic
//! begins.

use std::sync::Arc;
use std::time::Duration;

use prost::Message as _;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::MrpError;
use crate::net::Runtime;
use crate::protocol::crypto::HkdfSha512;
use crate::protocol::datastream::{DataStreamFrame, Heartbeat, MessageKind};
use crate::protocol::hap::HapSession;
use crate::protocol::mrp::{Command, Dispatcher, Envelope, Key, MIN_PRESS_GAP, MessageType, hid_event_payload};
use crate::protocol::pairing::{
    Credential, CredentialHalf, PairSetup, PairVerify, PairVerifyVariant, SessionKeys, SetupStepResult, VerifyStepResult,
};
use crate::protocol::rtsp::{Method, RtspCodec, RtspRequest, RtspResponse, RtspSession};
use crate::types::{AppleTvDevice, ClientConfig};

use super::state::{ConnectionEvent, ConnectionState, ConnectionStats, DisconnectReason};

const DATA_STREAM_TYPE: i64 = 130;
const DATA_STREAM_CONTROL_TYPE: i64 = 2;
const CLIENT_TYPE_UUID: &str = "1910A70F-DBC0-4242-AF95-115DB30604E1";

fn map_codec_err<E: std::fmt::Display>(e: E) -> MrpError {
    MrpError::Transport(e.to_string())
}

fn map_protocol_err<E: std::fmt::Display>(e: E) -> MrpError {
    MrpError::ProtocolViolation(e.to_string())
}

/// Write an RTSP request and wait for a complete, unencrypted response.
/// Used for pair-setup/pair-verify, which run before any HAP session
/// exists.
async fn send_rtsp_plain<S>(stream: &mut S, codec: &mut RtspCodec, request: &RtspRequest) -> Result<RtspResponse, MrpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&request.encode()).await?;

    let mut buf = [0u8; 4096];
    loop {
        if let Some(response) = codec.decode().map_err(map_codec_err)? {
            return Ok(response);
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(MrpError::Transport("connection closed while waiting for response".into()));
        }
        codec.feed(&buf[..n]).map_err(map_codec_err)?;
    }
}

/// Drive pair-verify to completion over `stream`, POSTing each step as a
/// plaintext RTSP request. Returns the derived session keys and the raw
/// shared secret (needed to derive the event/data channel keys, §3).
async fn run_pair_verify<S>(
    stream: &mut S,
    codec: &mut RtspCodec,
    rtsp: &mut RtspSession,
    credential: &CredentialHalf,
    variant: PairVerifyVariant,
) -> Result<(SessionKeys, [u8; 32]), MrpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pair_verify = PairVerify::new(variant, credential)?;

    let m1 = pair_verify.start()?;
    let request = rtsp.post_request("/pair-verify", "application/octet-stream", m1);
    let response = send_rtsp_plain(stream, codec, &request).await?;
    if !response.is_success() {
        return Err(MrpError::ProtocolViolation(format!("pair-verify M1 rejected: {}", response.status.as_u16())));
    }

    let VerifyStepResult::SendData(m3) = pair_verify.process_m2(&response.body)? else {
        return Err(MrpError::ProtocolViolation("pair-verify did not produce M3".into()));
    };

    let request = rtsp.post_request("/pair-verify", "application/octet-stream", m3);
    let response = send_rtsp_plain(stream, codec, &request).await?;
    if !response.is_success() {
        return Err(MrpError::ProtocolViolation(format!("pair-verify M3 rejected: {}", response.status.as_u16())));
    }

    let VerifyStepResult::Complete(keys) = pair_verify.process_m4(&response.body)? else {
        return Err(MrpError::ProtocolViolation("pair-verify did not complete".into()));
    };

    let shared_secret = pair_verify
        .shared_secret()
        .ok_or_else(|| MrpError::ProtocolViolation("pair-verify completed without a shared secret".into()))?;

    Ok((keys, shared_secret))
}

/// Drive pair-setup to completion over `stream`, triggering on-screen PIN
/// display first.
async fn run_pair_setup<S>(
    stream: &mut S,
    codec: &mut RtspCodec,
    rtsp: &mut RtspSession,
    client_identifier: String,
    pin: &str,
) -> Result<Credential, MrpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = rtsp.post_request("/pair-pin-start", "application/octet-stream", Vec::new());
    let _ = send_rtsp_plain(stream, codec, &request).await?;

    let mut pair_setup = PairSetup::new(client_identifier);
    pair_setup.set_pin(pin);

    let m1 = pair_setup.start()?;
    let request = rtsp.post_request("/pair-setup", "application/octet-stream", m1);
    let response = send_rtsp_plain(stream, codec, &request).await?;
    if !response.is_success() {
        return Err(MrpError::ProtocolViolation(format!("pair-setup M1 rejected: {}", response.status.as_u16())));
    }

    let SetupStepResult::SendData(m3) = pair_setup.step(Some(&response.body))? else {
        return Err(MrpError::ProtocolViolation("pair-setup did not produce M3".into()));
    };
    let request = rtsp.post_request("/pair-setup", "application/octet-stream", m3);
    let response = send_rtsp_plain(stream, codec, &request).await?;
    if !response.is_success() {
        return Err(MrpError::ProtocolViolation(format!("pair-setup M3 rejected: {}", response.status.as_u16())));
    }

    let SetupStepResult::SendData(m5) = pair_setup.step(Some(&response.body))? else {
        return Err(MrpError::ProtocolViolation("pair-setup did not produce M5".into()));
    };
    let request = rtsp.post_request("/pair-setup", "application/octet-stream", m5);
    let response = send_rtsp_plain(stream, codec, &request).await?;
    if !response.is_success() {
        return Err(MrpError::ProtocolViolation(format!("pair-setup M5 rejected: {}", response.status.as_u16())));
    }

    let SetupStepResult::Complete(credential) = pair_setup.step(Some(&response.body))? else {
        return Err(MrpError::ProtocolViolation("pair-setup did not complete".into()));
    };

    Ok(credential)
}

/// Derive a channel's write/read keys from the control channel's shared
/// secret using the documented salt/info strings (§3).
fn derive_channel_keys(shared_secret: &[u8; 32], salt: &str, write_info: &str, read_info: &str) -> Result<SessionKeys, MrpError> {
    let hkdf = HkdfSha512::new(Some(salt.as_bytes()), shared_secret);
    Ok(SessionKeys {
        write_key: hkdf.expand_fixed::<32>(write_info.as_bytes())?,
        read_key: hkdf.expand_fixed::<32>(read_info.as_bytes())?,
    })
}

/// The established control channel: socket, HAP session, RTSP session
/// state, and the accumulation buffer needed to decrypt responses that
/// arrive split across multiple reads.
struct ControlChannel {
    stream: TcpStream,
    session: HapSession,
    rtsp: RtspSession,
    codec: RtspCodec,
    cipher_buf: Vec<u8>,
}

/// Send an RTSP request over an established (HAP-encrypted) control
/// channel and wait for the decrypted, decoded response.
async fn send_rtsp_encrypted(channel: &mut ControlChannel, request: &RtspRequest) -> Result<RtspResponse, MrpError> {
    let ciphertext = channel.session.encrypt(&request.encode())?;
    channel.stream.write_all(&ciphertext).await?;

    let mut raw = [0u8; 4096];
    loop {
        if let Some(response) = channel.codec.decode().map_err(map_codec_err)? {
            return Ok(response);
        }
        let n = channel.stream.read(&mut raw).await?;
        if n == 0 {
            return Err(MrpError::Transport("control channel closed while waiting for response".into()));
        }
        channel.cipher_buf.extend_from_slice(&raw[..n]);
        let (plaintext, consumed) = channel.session.decrypt_available(&channel.cipher_buf)?;
        channel.cipher_buf.drain(..consumed);
        channel.codec.feed(&plaintext).map_err(map_codec_err)?;
    }
}

/// Extract a top-level integer-valued plist key (used for the event
/// channel SETUP response's `eventPort`).
fn extract_port(response: &RtspResponse, key: &str) -> Result<u16, MrpError> {
    let plist = response.body_as_plist().map_err(map_protocol_err)?;
    let dict = plist
        .as_dictionary()
        .ok_or_else(|| MrpError::ProtocolViolation("SETUP response is not a plist dictionary".into()))?;
    let value = dict
        .get(key)
        .and_then(plist::Value::as_signed_integer)
        .ok_or_else(|| MrpError::ProtocolViolation(format!("SETUP response missing {key}")))?;
    u16::try_from(value).map_err(|_| MrpError::ProtocolViolation(format!("{key} out of range: {value}")))
}

/// Extract the data channel's `streams[0].dataPort` from a data SETUP
/// response.
fn extract_data_port(response: &RtspResponse) -> Result<u16, MrpError> {
    let plist = response.body_as_plist().map_err(map_protocol_err)?;
    let port = plist
        .as_dictionary()
        .and_then(|dict| dict.get("streams"))
        .and_then(plist::Value::as_array)
        .and_then(|streams| streams.first())
        .and_then(plist::Value::as_dictionary)
        .and_then(|stream| stream.get("dataPort"))
        .and_then(plist::Value::as_signed_integer)
        .ok_or_else(|| MrpError::ProtocolViolation("SETUP response missing streams[0].dataPort".into()))?;
    u16::try_from(port).map_err(|_| MrpError::ProtocolViolation(format!("dataPort out of range: {port}")))
}

/// Build the data-channel SETUP request body (§4.7).
fn data_stream_setup_plist(channel_id: Uuid, seed: i32, client_uuid: Uuid) -> plist::Value {
    let mut stream = plist::Dictionary::new();
    stream.insert("type".to_string(), plist::Value::Integer(DATA_STREAM_TYPE.into()));
    stream.insert("controlType".to_string(), plist::Value::Integer(DATA_STREAM_CONTROL_TYPE.into()));
    stream.insert("channelID".to_string(), plist::Value::String(channel_id.to_string()));
    stream.insert("seed".to_string(), plist::Value::Integer(i64::from(seed).into()));
    stream.insert("clientUUID".to_string(), plist::Value::String(client_uuid.to_string()));
    stream.insert("wantsDedicatedSocket".to_string(), plist::Value::Boolean(true));
    stream.insert("clientTypeUUID".to_string(), plist::Value::String(CLIENT_TYPE_UUID.to_string()));

    let mut root = plist::Dictionary::new();
    root.insert("streams".to_string(), plist::Value::Array(vec![plist::Value::Dictionary(stream)]));
    plist::Value::Dictionary(root)
}

/// Accumulates ciphertext across reads and yields complete decrypted
/// `DataStream` frames. Shared by the synchronous MRP init dialogue and
/// the background data-channel task.
struct FrameReader {
    cipher_buf: Vec<u8>,
    plain_buf: Vec<u8>,
}

impl FrameReader {
    fn new() -> Self {
        Self { cipher_buf: Vec::new(), plain_buf: Vec::new() }
    }

    async fn next_frame<S>(&mut self, stream: &mut S, session: &mut HapSession) -> Result<DataStreamFrame, MrpError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut raw = [0u8; 4096];
        loop {
            if let Some((frame, consumed)) = DataStreamFrame::parse(&self.plain_buf).map_err(map_protocol_err)? {
                self.plain_buf.drain(..consumed);
                return Ok(frame);
            }
            let n = stream.read(&mut raw).await?;
            if n == 0 {
                return Err(MrpError::Transport("data channel closed".into()));
            }
            self.cipher_buf.extend_from_slice(&raw[..n]);
            let (plaintext, consumed) = session.decrypt_available(&self.cipher_buf)?;
            self.cipher_buf.drain(..consumed);
            self.plain_buf.extend_from_slice(&plaintext);
        }
    }
}

async fn write_data_frame<S>(stream: &mut S, session: &mut HapSession, frame: &DataStreamFrame) -> Result<(), MrpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let plaintext = frame.encode().map_err(map_protocol_err)?;
    let ciphertext = session.encrypt(&plaintext)?;
    stream.write_all(&ciphertext).await?;
    Ok(())
}

fn device_info_extension(name: &str, identifier: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    prost::encoding::string::encode(1, &name.to_string(), &mut buf);
    prost::encoding::string::encode(2, &identifier.to_string(), &mut buf);
    buf
}

fn set_connection_state_extension(state: i32) -> Vec<u8> {
    let mut buf = Vec::new();
    prost::encoding::int32::encode(1, &state, &mut buf);
    buf
}

fn client_updates_config_extension() -> Vec<u8> {
    let mut buf = Vec::new();
    prost::encoding::bool::encode(1, &true, &mut buf);
    prost::encoding::bool::encode(2, &true, &mut buf);
    prost::encoding::bool::encode(3, &true, &mut buf);
    prost::encoding::bool::encode(4, &true, &mut buf);
    buf
}

/// Run the five-step MRP init dialogue on a freshly opened data channel
/// (§4.7 step iv): DeviceInfo exchange, connection-state announcement,
/// client capability config, a keyboard-session request, then a short
/// settle window for unsolicited updates.
///
/// Every inbound `sync` frame observed along the way is replied to and
/// dispatched; this keeps the device's own request/reply bookkeeping
/// happy even while we're waiting on our own replies.
async fn run_mrp_init(
    stream: &mut TcpStream,
    session: &mut HapSession,
    reader: &mut FrameReader,
    sequence: u64,
    config: &ClientConfig,
    dispatcher: &Dispatcher,
) -> Result<(), MrpError> {
    async fn send(stream: &mut TcpStream, session: &mut HapSession, sequence: u64, envelope: &Envelope) -> Result<(), MrpError> {
        let frame = DataStreamFrame::sync(sequence, envelope.encode_to_vec());
        write_data_frame(stream, session, &frame).await
    }

    async fn recv_until<F>(
        stream: &mut TcpStream,
        session: &mut HapSession,
        reader: &mut FrameReader,
        dispatcher: &Dispatcher,
        timeout: Duration,
        mut matches: F,
    ) -> Result<(), MrpError>
    where
        F: FnMut(&Envelope) -> bool,
    {
        Runtime::timeout(timeout, async {
            loop {
                let frame = reader.next_frame(stream, session).await?;
                match frame.kind {
                    MessageKind::Sync => {
                        write_data_frame(stream, session, &DataStreamFrame::reply(frame.sequence)).await?;
                        if frame.protobuf_payload.is_empty() {
                            continue;
                        }
                        let envelope = Envelope::decode(frame.protobuf_payload.as_slice()).map_err(map_protocol_err)?;
                        let found = matches(&envelope);
                        dispatcher.dispatch(envelope);
                        if found {
                            return Ok(());
                        }
                    }
                    MessageKind::Reply => {
                        // Acknowledges one of our own sync frames; nothing to do.
                    }
                }
            }
        })
        .await?
    }

    // (i) DeviceInfo exchange.
    let device_info = Envelope::new(
        MessageType::DeviceInfo,
        Some(Uuid::new_v4().to_string()),
        device_info_extension(&config.user_agent, &config.client_identifier),
    );
    send(stream, session, sequence, &device_info).await?;
    recv_until(stream, session, reader, dispatcher, config.request_timeout, |envelope| {
        envelope.message_type == MessageType::DeviceInfo
    })
    .await?;

    // (ii) SetConnectionState(state=2), no reply expected.
    let set_state = Envelope::new(
        MessageType::SetConnectionState,
        Some(Uuid::new_v4().to_string()),
        set_connection_state_extension(2),
    );
    send(stream, session, sequence, &set_state).await?;

    // (iii) ClientUpdatesConfig.
    let updates_config = Envelope::new(
        MessageType::ClientUpdatesConfig,
        Some(Uuid::new_v4().to_string()),
        client_updates_config_extension(),
    );
    send(stream, session, sequence, &updates_config).await?;

    // (iv) GetKeyboardSession has no dedicated MessageType (see DESIGN.md);
    // carried as an empty-extension GenericMessage.
    let keyboard_session = Envelope::new(MessageType::GenericMessage, Some(Uuid::new_v4().to_string()), Vec::new());
    send(stream, session, sequence, &keyboard_session).await?;

    // (v) settle window for unsolicited updates.
    Runtime::sleep(config.mrp_init_settle).await;

    Ok(())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn extract_header(headers: &str, name: &str) -> Option<String> {
    headers.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) { Some(value.trim().to_string()) } else { None }
    })
}

fn build_event_reply(cseq: Option<&str>, user_agent: &str) -> String {
    let mut reply = String::from("RTSP/1.0 200 OK\r\n");
    if let Some(cseq) = cseq {
        reply.push_str(&format!("CSeq: {cseq}\r\n"));
    }
    reply.push_str(&format!("Server: {user_agent}\r\n\r\n"));
    reply
}

/// Relays inbound encrypted HTTP-shaped requests on the event channel:
/// decrypt, reply with a minimal `200 OK` echoing `CSeq`/`Server`, and
/// re-encrypt. Runs for the lifetime of the connection.
async fn run_event_channel(
    mut stream: TcpStream,
    mut session: HapSession,
    device: AppleTvDevice,
    user_agent: String,
    event_tx: broadcast::Sender<ConnectionEvent>,
) {
    let mut cipher_buf = Vec::new();
    let mut inbound = Vec::new();
    let mut raw = [0u8; 4096];

    loop {
        let n = match stream.read(&mut raw).await {
            Ok(0) => {
                let _ = event_tx.send(ConnectionEvent::Disconnected {
                    device: device.clone(),
                    reason: DisconnectReason::NetworkError("event channel closed".into()),
                });
                return;
            }
            Ok(n) => n,
            Err(e) => {
                let _ = event_tx.send(ConnectionEvent::Disconnected {
                    device: device.clone(),
                    reason: DisconnectReason::NetworkError(e.to_string()),
                });
                return;
            }
        };
        cipher_buf.extend_from_slice(&raw[..n]);

        let (plaintext, consumed) = match session.decrypt_available(&cipher_buf) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("event channel decrypt failed: {e}");
                let _ = event_tx.send(ConnectionEvent::Disconnected {
                    device: device.clone(),
                    reason: DisconnectReason::AuthenticationFailed,
                });
                return;
            }
        };
        cipher_buf.drain(..consumed);
        inbound.extend_from_slice(&plaintext);

        while let Some(request_end) = find_header_end(&inbound) {
            let header_text = String::from_utf8_lossy(&inbound[..request_end]).to_string();
            let content_length = extract_header(&header_text, "Content-Length").and_then(|v| v.parse::<usize>().ok()).unwrap_or(0);
            let total_len = request_end + 4 + content_length;
            if inbound.len() < total_len {
                break;
            }

            let cseq = extract_header(&header_text, "CSeq");
            let response = build_event_reply(cseq.as_deref(), &user_agent);
            match session.encrypt(response.as_bytes()) {
                Ok(ciphertext) => {
                    if let Err(e) = stream.write_all(&ciphertext).await {
                        tracing::warn!("failed to write event channel reply: {e}");
                        let _ = event_tx.send(ConnectionEvent::Disconnected {
                            device: device.clone(),
                            reason: DisconnectReason::NetworkError(e.to_string()),
                        });
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("failed to encrypt event channel reply: {e}");
                }
            }

            inbound.drain(..total_len);
        }
    }
}

/// Owns the data channel socket and HAP session for the lifetime of the
/// connection: relays outbound MRP envelopes requested through `outbound`
/// and dispatches inbound envelopes, replying to every `sync` frame.
async fn run_data_channel(
    mut stream: TcpStream,
    mut session: HapSession,
    mut reader: FrameReader,
    sequence: u64,
    mut outbound: mpsc::Receiver<Envelope>,
    dispatcher: Arc<Dispatcher>,
    device: AppleTvDevice,
    event_tx: broadcast::Sender<ConnectionEvent>,
) {
    loop {
        tokio::select! {
            biased;

            sent = outbound.recv() => {
                let Some(envelope) = sent else {
                    break;
                };
                let frame = DataStreamFrame::sync(sequence, envelope.encode_to_vec());
                if let Err(e) = write_data_frame(&mut stream, &mut session, &frame).await {
                    tracing::warn!("failed to write data channel frame: {e}");
                    let _ = event_tx.send(ConnectionEvent::Disconnected {
                        device: device.clone(),
                        reason: DisconnectReason::NetworkError(e.to_string()),
                    });
                    break;
                }
            }

            frame = reader.next_frame(&mut stream, &mut session) => {
                match frame {
                    Ok(frame) => {
                        if matches!(frame.kind, MessageKind::Sync) {
                            if let Err(e) = write_data_frame(&mut stream, &mut session, &DataStreamFrame::reply(frame.sequence)).await {
                                tracing::warn!("failed to ack data channel frame: {e}");
                                let _ = event_tx.send(ConnectionEvent::Disconnected {
                                    device: device.clone(),
                                    reason: DisconnectReason::NetworkError(e.to_string()),
                                });
                                break;
                            }
                            if !frame.protobuf_payload.is_empty() {
                                match Envelope::decode(frame.protobuf_payload.as_slice()) {
                                    Ok(envelope) => {
                                        dispatcher.dispatch(envelope);
                                    }
                                    Err(e) => {
                                        tracing::warn!("dropping malformed MRP envelope: {e}");
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("data channel transport error: {e}");
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

/// Periodically sends `POST /feedback` on the control channel (§4.7).
/// Failures are logged and non-fatal; if the control channel has been
/// torn down, the send is simply skipped and the task exits.
async fn run_heartbeat(control: Arc<Mutex<Option<ControlChannel>>>, config: ClientConfig) {
    let heartbeat = Heartbeat::new(&config);
    loop {
        heartbeat.wait_for_next_tick().await;
        let mut guard = control.lock().await;
        let Some(channel) = guard.as_mut() else {
            return;
        };
        let request = channel.rtsp.feedback_request();
        if let Err(e) = send_rtsp_encrypted(channel, &request).await {
            tracing::warn!("heartbeat POST /feedback failed: {e}");
        }
    }
}

/// The outbound side of an established data channel: a sender the
/// manager's public API uses to request MRP sends, serviced by
/// [`run_data_channel`].
struct DataChannelHandle {
    outbound: mpsc::Sender<Envelope>,
}

/// Drives one AirPlay device's connection lifecycle: pairing, the
/// control/event/data channel setup sequence, and steady-state MRP
/// command dispatch.
pub struct ConnectionManager {
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    device: RwLock<Option<AppleTvDevice>>,
    control: Arc<Mutex<Option<ControlChannel>>>,
    data: Mutex<Option<DataChannelHandle>>,
    stats: RwLock<ConnectionStats>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    dispatcher: Arc<Dispatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a new, disconnected connection manager.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            device: RwLock::new(None),
            control: Arc::new(Mutex::new(None)),
            data: Mutex::new(None),
            stats: RwLock::new(ConnectionStats::default()),
            event_tx,
            dispatcher: Arc::new(Dispatcher::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The currently connected (or last connected) device, if any.
    pub async fn device(&self) -> Option<AppleTvDevice> {
        self.device.read().await.clone()
    }

    /// A snapshot of connection statistics.
    pub async fn stats(&self) -> ConnectionStats {
        self.stats.read().await.clone()
    }

    /// Subscribe to connection lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Subscribe to inbound MRP envelopes dispatched from the data
    /// channel.
    #[must_use]
    pub fn subscribe_mrp(&self) -> broadcast::Receiver<Envelope> {
        self.dispatcher.subscribe()
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

    /// Run pair-setup against `device`, triggering on-screen PIN display
    /// and exchanging the SRP-based handshake to produce a durable
    /// credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the device has no usable address, the TCP
    /// connection fails, or the handshake is rejected.
    pub async fn pair_setup(&self, device: &AppleTvDevice, pin: &str) -> Result<Credential, MrpError> {
        let addr = device.address().ok_or_else(|| MrpError::Configuration("device has no usable address".into()))?;
        let mut stream = Runtime::timeout(self.config.pairing_timeout, TcpStream::connect((addr, device.control_port))).await??;

        let mut rtsp = RtspSession::new(&addr.to_string(), device.control_port);
        let mut codec = RtspCodec::new();

        run_pair_setup(&mut stream, &mut codec, &mut rtsp, self.config.client_identifier.clone(), pin).await
    }

    /// Establish a full connection to `device` using a previously stored
    /// AirPlay credential half: control channel pair-verify, event
    /// channel SETUP/RECORD plus heartbeat, data channel SETUP and the
    /// MRP init dialogue.
    ///
    /// # Errors
    ///
    /// Returns an error at any step of the state machine; the connection
    /// is left in `Closing`/`Disconnected` on failure.
    pub async fn connect(&self, device: &AppleTvDevice, credential: &CredentialHalf) -> Result<(), MrpError> {
        {
            let current = *self.state.read().await;
            if current.is_active() || current.is_ready() {
                return Err(MrpError::Configuration("connection already active".into()));
            }
        }
        *self.device.write().await = Some(device.clone());

        self.set_state(ConnectionState::TcpOpen).await;
        let addr = device.address().ok_or_else(|| MrpError::Configuration("device has no usable address".into()))?;
        let mut control_stream =
            Runtime::timeout(self.config.pairing_timeout, TcpStream::connect((addr, device.control_port))).await??;

        self.set_state(ConnectionState::VerifyInProgress).await;
        let mut rtsp = RtspSession::new(&addr.to_string(), device.control_port);
        let mut codec = RtspCodec::new();
        let (control_keys, shared_secret) = Runtime::timeout(
            self.config.pairing_timeout,
            run_pair_verify(&mut control_stream, &mut codec, &mut rtsp, credential, PairVerifyVariant::AirPlay),
        )
        .await??;

        self.set_state(ConnectionState::VerifyComplete).await;
        let control_session = HapSession::new(&control_keys.write_key, &control_keys.read_key)?;
        let mut control_channel = ControlChannel { stream: control_stream, session: control_session, rtsp, codec, cipher_buf: Vec::new() };

        self.set_state(ConnectionState::SetupInProgress).await;

        // Event channel: SETUP, RECORD, then open the dedicated socket.
        let event_setup = control_channel.rtsp.setup_session_request(&plist::Value::Dictionary(plist::Dictionary::new()), None);
        let event_response = send_rtsp_encrypted(&mut control_channel, &event_setup).await?;
        if !event_response.is_success() {
            return Err(MrpError::ProtocolViolation(format!("event SETUP rejected: {}", event_response.status.as_u16())));
        }
        control_channel.rtsp.process_response(Method::Setup, &event_response).map_err(MrpError::ProtocolViolation)?;
        let event_port = extract_port(&event_response, "eventPort")?;

        let record = control_channel.rtsp.record_request();
        let record_response = send_rtsp_encrypted(&mut control_channel, &record).await?;
        if !record_response.is_success() {
            return Err(MrpError::ProtocolViolation(format!("RECORD rejected: {}", record_response.status.as_u16())));
        }
        control_channel.rtsp.process_response(Method::Record, &record_response).map_err(MrpError::ProtocolViolation)?;

        let event_keys = derive_channel_keys(&shared_secret, "Events-Salt", "Events-Write-Encryption-Key", "Events-Read-Encryption-Key")?;
        let event_session = HapSession::new(&event_keys.write_key, &event_keys.read_key)?;
        let event_stream = Runtime::timeout(self.config.pairing_timeout, TcpStream::connect((addr, event_port))).await??;

        let event_task = tokio::spawn(run_event_channel(event_stream, event_session, device.clone(), self.config.user_agent.clone(), self.event_tx.clone()));

        // Data channel: SETUP with the documented stream descriptor, then
        // open the dedicated socket and run the MRP init dialogue before
        // handing the channel off to the background task.
        let seed: i32 = rand::thread_rng().r#gen();
        let channel_id = Uuid::new_v4();
        let client_uuid = Uuid::new_v4();
        let data_plist = data_stream_setup_plist(channel_id, seed, client_uuid);
        let data_setup = control_channel.rtsp.setup_session_request(&data_plist, None);
        let data_response = send_rtsp_encrypted(&mut control_channel, &data_setup).await?;
        if !data_response.is_success() {
            return Err(MrpError::ProtocolViolation(format!("data SETUP rejected: {}", data_response.status.as_u16())));
        }
        let data_port = extract_data_port(&data_response)?;

        let data_keys = derive_channel_keys(
            &shared_secret,
            &format!("DataStream-Salt{seed}"),
            "DataStream-Output-Encryption-Key",
            "DataStream-Input-Encryption-Key",
        )?;
        let mut data_session = HapSession::new(&data_keys.write_key, &data_keys.read_key)?;
        let mut data_stream = Runtime::timeout(self.config.pairing_timeout, TcpStream::connect((addr, data_port))).await??;

        let mut reader = FrameReader::new();
        let sequence: u64 = rand::thread_rng().r#gen();
        run_mrp_init(&mut data_stream, &mut data_session, &mut reader, sequence, &self.config, &self.dispatcher).await?;

        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        *self.data.lock().await = Some(DataChannelHandle { outbound: outbound_tx });

        let data_task = tokio::spawn(run_data_channel(
            data_stream,
            data_session,
            reader,
            sequence,
            outbound_rx,
            Arc::clone(&self.dispatcher),
            device.clone(),
            self.event_tx.clone(),
        ));

        *self.control.lock().await = Some(control_channel);
        let heartbeat_task = tokio::spawn(run_heartbeat(Arc::clone(&self.control), self.config.clone()));

        {
            let mut tasks = self.tasks.lock().await;
            tasks.push(event_task);
            tasks.push(data_task);
            tasks.push(heartbeat_task);
        }

        self.stats.write().await.connected_at = Some(Runtime::now());
        self.set_state(ConnectionState::Ready).await;
        let _ = self.event_tx.send(ConnectionEvent::Connected { device: device.clone() });
        Ok(())
    }

    async fn send_envelope(&self, envelope: Envelope) -> Result<(), MrpError> {
        let guard = self.data.lock().await;
        let handle = guard.as_ref().ok_or_else(|| MrpError::Configuration("data channel not established".into()))?;
        handle.outbound.send(envelope).await.map_err(|_| MrpError::Transport("data channel closed".into()))
    }

    /// Send a media playback command.
    ///
    /// # Errors
    ///
    /// Returns an error if the data channel is not established or has
    /// closed.
    pub async fn send_command(&self, command: Command) -> Result<(), MrpError> {
        let mut extension = Vec::new();
        prost::encoding::int32::encode(1, &(command as i32), &mut extension);
        let envelope = Envelope::new(MessageType::SendCommand, Some(Uuid::new_v4().to_string()), extension);
        self.send_envelope(envelope).await
    }

    /// Press a remote key: a HID down event, then (after [`MIN_PRESS_GAP`])
    /// a HID up event, followed by an empty `GenericMessage` flush, per
    /// §4.9.
    ///
    /// # Errors
    ///
    /// Returns an error if the data channel is not established or has
    /// closed.
    pub async fn press_key(&self, key: Key) -> Result<(), MrpError> {
        let down = hid_event_payload(key, true);
        self.send_envelope(Envelope::new(MessageType::SendHIDEvent, Some(Uuid::new_v4().to_string()), down.to_vec())).await?;

        Runtime::sleep(MIN_PRESS_GAP).await;

        let up = hid_event_payload(key, false);
        self.send_envelope(Envelope::new(MessageType::SendHIDEvent, Some(Uuid::new_v4().to_string()), up.to_vec())).await?;

        self.send_envelope(Envelope::new(MessageType::GenericMessage, Some(Uuid::new_v4().to_string()), Vec::new())).await
    }

    /// Tear down all channels and background tasks.
    pub async fn disconnect(&self) {
        self.set_state(ConnectionState::Closing).await;

        *self.data.lock().await = None;
        *self.control.lock().await = None;

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            task.abort();
        }

        self.set_state(ConnectionState::Disconnected).await;
        if let Some(device) = self.device.read().await.clone() {
            let _ = self.event_tx.send(ConnectionEvent::Disconnected { device, reason: DisconnectReason::UserRequested });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::rtsp::{Headers, StatusCode};
    use crate::testing::MockApplePeer;

    #[tokio::test]
    async fn send_rtsp_plain_round_trips_a_response() {
        let (mut peer, mut stream) = MockApplePeer::pair(8192);
        let mut codec = RtspCodec::new();
        let request = RtspRequest::builder(Method::Options, "*").cseq(1).build();
        let encoded_len = request.encode().len();

        let client_task = tokio::spawn(async move { send_rtsp_plain(&mut stream, &mut codec, &request).await });

        let _ = peer.read_exact(encoded_len).await.unwrap();
        peer.write_all(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 0\r\n\r\n").await.unwrap();

        let response = client_task.await.unwrap().unwrap();
        assert!(response.is_success());
        assert_eq!(response.cseq(), Some(1));
    }

    #[tokio::test]
    async fn send_rtsp_plain_reports_closed_connection() {
        let (peer, mut stream) = MockApplePeer::pair(8192);
        let mut codec = RtspCodec::new();
        let request = RtspRequest::builder(Method::Options, "*").cseq(1).build();

        drop(peer);
        let result = send_rtsp_plain(&mut stream, &mut codec, &request).await;
        assert!(matches!(result, Err(MrpError::Io(_)) | Err(MrpError::Transport(_))));
    }

    #[test]
    fn data_stream_setup_plist_matches_documented_shape() {
        let channel_id = Uuid::new_v4();
        let client_uuid = Uuid::new_v4();
        let value = data_stream_setup_plist(channel_id, 42, client_uuid);
        let dict = value.as_dictionary().unwrap();
        let streams = dict.get("streams").unwrap().as_array().unwrap();
        let stream = streams[0].as_dictionary().unwrap();
        assert_eq!(stream.get("type").unwrap().as_signed_integer(), Some(DATA_STREAM_TYPE));
        assert_eq!(stream.get("controlType").unwrap().as_signed_integer(), Some(DATA_STREAM_CONTROL_TYPE));
        assert_eq!(stream.get("seed").unwrap().as_signed_integer(), Some(42));
        assert_eq!(stream.get("wantsDedicatedSocket").unwrap().as_boolean(), Some(true));
        assert_eq!(stream.get("clientTypeUUID").unwrap().as_string(), Some(CLIENT_TYPE_UUID));
    }

    #[test]
    fn extract_port_reads_a_top_level_integer() {
        let mut dict = plist::Dictionary::new();
        dict.insert("eventPort".to_string(), plist::Value::Integer(7010.into()));
        let mut buf = Vec::new();
        plist::to_writer_binary(&mut buf, &plist::Value::Dictionary(dict)).unwrap();
        let response = RtspResponse { version: "RTSP/1.0".to_string(), status: StatusCode::OK, reason: "OK".to_string(), headers: Headers::new(), body: buf };
        assert_eq!(extract_port(&response, "eventPort").unwrap(), 7010);
    }

    #[test]
    fn extract_data_port_reads_streams_first_entry() {
        let mut stream = plist::Dictionary::new();
        stream.insert("dataPort".to_string(), plist::Value::Integer(7011.into()));
        let mut dict = plist::Dictionary::new();
        dict.insert("streams".to_string(), plist::Value::Array(vec![plist::Value::Dictionary(stream)]));
        let mut buf = Vec::new();
        plist::to_writer_binary(&mut buf, &plist::Value::Dictionary(dict)).unwrap();
        let response = RtspResponse { version: "RTSP/1.0".to_string(), status: StatusCode::OK, reason: "OK".to_string(), headers: Headers::new(), body: buf };
        assert_eq!(extract_data_port(&response).unwrap(), 7011);
    }

    #[test]
    fn build_event_reply_echoes_cseq_and_server() {
        let reply = build_event_reply(Some("7"), "mrplink/1.0");
        assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(reply.contains("CSeq: 7\r\n"));
        assert!(reply.contains("Server: mrplink/1.0\r\n"));
        assert!(reply.ends_with("\r\n\r\n"));
    }

    #[test]
    fn extract_header_is_case_insensitive() {
        let headers = "CSeq: 3\r\ncontent-length: 10\r\n";
        assert_eq!(extract_header(headers, "cseq"), Some("3".to_string()));
        assert_eq!(extract_header(headers, "Content-Length"), Some("10".to_string()));
        assert_eq!(extract_header(headers, "missing"), None);
    }

    #[tokio::test]
    async fn connect_rejects_a_device_with_no_address() {
        let manager = ConnectionManager::new(ClientConfig::default());
        let device = AppleTvDevice::new("id", "name", vec![], 7000);
        let credential = test_credential_half();
        let result = manager.connect(&device, &credential).await;
        assert!(matches!(result, Err(MrpError::Configuration(_))));
    }

    fn test_credential_half() -> CredentialHalf {
        use crate::protocol::crypto::Ed25519KeyPair;
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
}

//! Device reservation client for the farm coordinator.
//!
//! The coordinator is a Socket.IO v4 server. A client joins with its device
//! tag and job id, then waits until the coordinator pushes a device:
//!
//! ```text
//! client                         coordinator
//!   |  ws connect                    |
//!   | <--------------- 0{sid,...}    |  engine open
//!   | 40 --------------------------> |  namespace connect
//!   | <--------------------- 40{..}  |  ack
//!   | 42["jen_device","{tag,id}"] -> |  join
//!   | <--- 42["svc_device",{ip,..}]  |  device granted (maybe much later)
//!   | 42["jen_out","bye"] ---------> |  release
//!   | 41 --------------------------> |
//! ```
//!
//! The socket is owned by a background task that answers heartbeats and
//! forwards coordinator events over a channel; [`ReservationClient`] is the
//! handle the session drives.

pub mod packet;

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::constants::RELEASE_TIMEOUT;
use crate::device::DeviceAddress;
use crate::error::{Error, ErrorKind, Result};
use crate::status::{messages, SharedStatus};
use packet::{EnginePacket, SocketPacket};

/// Client to coordinator: join the queue for a device.
pub const JOIN_EVENT: &str = "jen_device";
/// Coordinator to client: a device was granted.
pub const DEVICE_EVENT: &str = "svc_device";
/// Client to coordinator: the device is no longer needed.
pub const RELEASE_EVENT: &str = "jen_out";
/// Argument of [`RELEASE_EVENT`].
pub const RELEASE_MESSAGE: &str = "bye";

/// Smallest poll interval accepted; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Longest wait or poll interval honored. Larger values would overflow
/// `Instant` arithmetic.
const MAX_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// What to ask the coordinator for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    tag: String,
    job_id: String,
}

impl ReservationRequest {
    /// Request a device matching `tag` on behalf of `job_id`.
    pub fn new(tag: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            job_id: job_id.into(),
        }
    }

    /// Device tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Job id, unescaped.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Job id in `application/x-www-form-urlencoded` form, as the coordinator
    /// expects it.
    pub fn encoded_job_id(&self) -> String {
        url::form_urlencoded::byte_serialize(self.job_id.as_bytes()).collect()
    }

    /// The `{tag, id}` JSON text sent as the join argument.
    pub fn join_payload(&self) -> String {
        serde_json::json!({
            "tag": self.tag,
            "id": self.encoded_job_id(),
        })
        .to_string()
    }
}

/// A device granted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    address: DeviceAddress,
    tag: Option<String>,
    url: Option<String>,
}

#[derive(Deserialize)]
struct RawDevice {
    ip: Option<String>,
    port: Option<RawPort>,
    tag: Option<String>,
    url: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(u64),
    Text(String),
}

impl RemoteDevice {
    /// Device at `address`.
    pub fn new(address: DeviceAddress, tag: Option<String>, url: Option<String>) -> Self {
        Self { address, tag, url }
    }

    /// Parse a reservation payload: either the JSON object itself or a JSON
    /// string containing it.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        match payload {
            Value::String(text) => Self::parse(text),
            Value::Object(_) => Self::from_raw(
                RawDevice::deserialize(payload)
                    .map_err(|e| Error::malformed("unexpected reservation fields").with_source(e))?,
            ),
            other => Err(Error::malformed(format!(
                "reservation payload is not an object: {other}"
            ))),
        }
    }

    /// Parse reservation JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawDevice = serde_json::from_str(text).map_err(|e| {
            Error::malformed(format!("invalid reservation JSON: {text}")).with_source(e)
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawDevice) -> Result<Self> {
        let ip = raw
            .ip
            .ok_or_else(|| Error::malformed("reservation is missing 'ip'"))?;
        let port = match raw.port {
            Some(RawPort::Number(n)) => u16::try_from(n).ok(),
            Some(RawPort::Text(s)) => s.trim().parse::<u16>().ok(),
            None => return Err(Error::malformed("reservation is missing 'port'")),
        }
        .ok_or_else(|| Error::malformed("reservation 'port' is not a valid port number"))?;

        let address = DeviceAddress::new(&ip, port).map_err(|e| {
            Error::malformed(format!("reservation address is invalid: {}", e.message()))
                .with_source(e)
        })?;
        Ok(Self::new(address, raw.tag, raw.url))
    }

    /// Device address.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// adb serial.
    pub fn serial(&self) -> &str {
        self.address.serial()
    }

    /// Tag of the granted device, if the coordinator sent one.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Coordinator-provided URL (e.g. a remote screen viewer), if any.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}

/// `null`, blank strings and `{}` do not count as a reservation.
fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Map the coordinator endpoint to its Socket.IO WebSocket URL.
///
/// `http(s)://host:port/...` becomes
/// `ws(s)://host:port/socket.io/?EIO=4&transport=websocket`.
pub fn socket_url(endpoint: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(endpoint.trim()).map_err(|e| {
        Error::connection(format!("malformed endpoint URL '{endpoint}'")).with_source(e)
    })?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::connection(format!(
                "unsupported endpoint scheme '{other}' in '{endpoint}'"
            )))
        }
    };
    if url.host_str().is_none() {
        return Err(Error::connection(format!("endpoint '{endpoint}' has no host")));
    }
    url.set_scheme(scheme)
        .map_err(|()| Error::connection(format!("cannot use '{endpoint}' as a WebSocket URL")))?;
    url.set_path("/socket.io/");
    url.set_query(Some("EIO=4&transport=websocket"));
    url.set_fragment(None);
    Ok(url)
}

/// Events forwarded from the socket task.
#[derive(Debug)]
enum FarmEvent {
    Device(Value),
    Disconnected(String),
}

/// What an incoming text frame asks of the socket task.
#[derive(Debug, PartialEq)]
enum Incoming {
    Reply(String),
    Device(Value),
    Disconnected(String),
    Ignore,
}

fn interpret(text: &str) -> Incoming {
    let packet = match packet::decode_engine(text) {
        Ok(packet) => packet,
        Err(e) => {
            log::debug!("[Reservation] Ignoring frame '{}': {}", text, e);
            return Incoming::Ignore;
        }
    };
    match packet {
        EnginePacket::Ping(data) => Incoming::Reply(packet::encode_pong(&data)),
        EnginePacket::Close => Incoming::Disconnected("transport closed by server".into()),
        EnginePacket::Message(inner) => match packet::decode_socket(&inner) {
            Ok(SocketPacket::Event { name, mut args }) if name == DEVICE_EVENT => {
                Incoming::Device(if args.is_empty() {
                    Value::Null
                } else {
                    args.swap_remove(0)
                })
            }
            Ok(SocketPacket::Event { name, .. }) => {
                log::debug!("[Reservation] Ignoring event '{}'", name);
                Incoming::Ignore
            }
            Ok(SocketPacket::Disconnect) => {
                Incoming::Disconnected("disconnected by server".into())
            }
            Ok(_) => Incoming::Ignore,
            Err(e) => {
                log::warn!("[Reservation] Undecodable packet '{}': {}", inner, e);
                Incoming::Ignore
            }
        },
        _ => Incoming::Ignore,
    }
}

/// Handle to a live coordinator connection.
///
/// Dropping the handle without calling [`release`](Self::release) closes
/// the socket without the farewell events.
#[derive(Debug)]
pub struct ReservationClient {
    events: mpsc::Receiver<FarmEvent>,
    release_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    released: bool,
    status: SharedStatus,
}

impl ReservationClient {
    /// Connect to `endpoint`, complete the Socket.IO handshake, and join the
    /// queue for `request`.
    ///
    /// Fails with `ConnectionFailure` if the URL is malformed, the endpoint is
    /// unreachable, or the handshake does not finish within `connect_timeout`.
    pub async fn connect(
        endpoint: &str,
        request: &ReservationRequest,
        connect_timeout: Duration,
        status: SharedStatus,
    ) -> Result<Self> {
        let url = socket_url(endpoint)?;
        log::info!(
            "[Reservation] Connecting to {} (tag={}, job={})",
            url,
            request.tag(),
            request.job_id()
        );

        let join = packet::encode_event(JOIN_EVENT, &[Value::String(request.join_payload())]);
        let socket = tokio::time::timeout(connect_timeout, handshake(url.as_str(), join))
            .await
            .map_err(|elapsed| {
                Error::connection(format!(
                    "no handshake acknowledgment from {} within {}ms",
                    url,
                    connect_timeout.as_millis()
                ))
                .with_source(elapsed)
            })??;
        log::info!("[Reservation] Joined queue for tag '{}'", request.tag());

        let (sink, stream) = socket.split();
        let (events_tx, events) = mpsc::channel(16);
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_event_loop(sink, stream, events_tx, release_rx));

        Ok(Self {
            events,
            release_tx,
            task: Some(task),
            released: false,
            status,
        })
    }

    /// Wait for the coordinator to grant a device.
    ///
    /// Emits a "waiting" status line every `poll_interval`. Returns the first
    /// non-empty payload, parsed. `Ok(None)` means `cancel` fired. Fails with
    /// `ReservationTimeout` once `overall_timeout` has passed,
    /// `ConnectionFailure` if the coordinator goes away, or
    /// `MalformedResponse` if the payload cannot be parsed. The connection is
    /// released before any of these errors is returned; reporting the failure
    /// to the user is left to the caller.
    pub async fn await_reservation(
        &mut self,
        overall_timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<RemoteDevice>> {
        let result = self.wait_for_device(overall_timeout, poll_interval, cancel).await;
        if result.is_err() {
            self.release().await;
        }
        result
    }

    async fn wait_for_device(
        &mut self,
        overall_timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<RemoteDevice>> {
        let now = Instant::now();
        let deadline = now
            .checked_add(overall_timeout)
            .unwrap_or_else(|| now + MAX_WAIT);
        let mut ticker = tokio::time::interval(poll_interval.clamp(MIN_POLL_INTERVAL, MAX_WAIT));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    log::info!("[Reservation] Wait cancelled");
                    return Ok(None);
                }

                event = self.events.recv() => match event {
                    Some(FarmEvent::Device(payload)) => {
                        if is_empty_payload(&payload) {
                            log::debug!("[Reservation] Ignoring empty payload");
                            continue;
                        }
                        let device = RemoteDevice::from_payload(&payload)
                            .inspect_err(|e| log::error!("[Reservation] {}", e))?;
                        log::info!("[Reservation] Reserved {}", device.serial());
                        self.status.status(&messages::device_ready(device.tag()));
                        return Ok(Some(device));
                    }
                    Some(FarmEvent::Disconnected(reason)) => {
                        return Err(Error::connection(format!(
                            "coordinator went away before granting a device: {reason}"
                        )));
                    }
                    None => return Err(Error::connection("coordinator connection ended")),
                },

                () = tokio::time::sleep_until(deadline) => {
                    return Err(Error::new(
                        ErrorKind::ReservationTimeout,
                        format!("no device granted within {}s", overall_timeout.as_secs()),
                    ));
                }

                _ = ticker.tick() => {
                    self.status.status(messages::WAITING_FOR_DEVICE);
                }
            }
        }
    }

    /// Tell the coordinator the device is no longer needed and close the
    /// connection. Safe to call more than once; never fails.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.release_tx.send(ack_tx).is_ok() {
            match tokio::time::timeout(RELEASE_TIMEOUT, ack_rx).await {
                Ok(Ok(())) => log::info!("[Reservation] Released"),
                Ok(Err(_)) => log::debug!("[Reservation] Connection already closed"),
                Err(_) => log::warn!("[Reservation] Release handshake timed out"),
            }
        } else {
            log::debug!("[Reservation] Connection already closed, nothing to release");
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether [`release`](Self::release) has run.
    pub fn is_released(&self) -> bool {
        self.released
    }
}

fn socket_error(context: &str, e: tokio_tungstenite::tungstenite::Error) -> Error {
    Error::connection(context.to_string()).with_source(e)
}

/// Connect, run the Engine.IO and Socket.IO handshakes, then send `join`.
async fn handshake(url: &str, join: String) -> Result<Socket> {
    let (mut socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| socket_error(&format!("cannot reach {url}"), e))?;
    log::debug!("[Reservation] WebSocket connected");

    wait_for_ack(&mut socket).await?;

    socket
        .send(Message::Text(join))
        .await
        .map_err(|e| socket_error("failed to send join request", e))?;
    Ok(socket)
}

/// Answer the Engine.IO open with a namespace connect and wait for its ack.
async fn wait_for_ack(socket: &mut Socket) -> Result<()> {
    let mut opened = false;

    while let Some(msg) = socket.next().await {
        let msg = msg.map_err(|e| socket_error("WebSocket error during handshake", e))?;
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match packet::decode_engine(&text)? {
            EnginePacket::Open(info) if !opened => {
                opened = true;
                log::debug!("[Reservation] Engine open: {}", info);
                socket
                    .send(Message::Text(packet::encode_connect()))
                    .await
                    .map_err(|e| socket_error("failed to send namespace connect", e))?;
            }
            EnginePacket::Ping(data) => {
                socket
                    .send(Message::Text(packet::encode_pong(&data)))
                    .await
                    .map_err(|e| socket_error("failed to answer ping", e))?;
            }
            EnginePacket::Close => break,
            EnginePacket::Message(inner) => match packet::decode_socket(&inner)? {
                SocketPacket::Connect(_) if opened => {
                    log::debug!("[Reservation] Namespace connect acknowledged");
                    return Ok(());
                }
                SocketPacket::ConnectError(detail) => {
                    return Err(Error::connection(format!(
                        "coordinator refused the connection: {}",
                        detail.unwrap_or(Value::Null)
                    )));
                }
                SocketPacket::Disconnect => break,
                _ => {}
            },
            _ => {}
        }
    }

    Err(Error::connection("connection closed during handshake"))
}

/// Own the socket: answer heartbeats, forward events, and send the farewell
/// when asked.
async fn run_event_loop(
    mut sink: SplitSink<Socket, Message>,
    mut stream: SplitStream<Socket>,
    events: mpsc::Sender<FarmEvent>,
    mut release_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
) {
    loop {
        tokio::select! {
            msg = stream.next() => {
                let reason = match msg {
                    Some(Ok(Message::Text(text))) => match interpret(&text) {
                        Incoming::Reply(reply) => {
                            if let Err(e) = sink.send(Message::Text(reply)).await {
                                log::warn!("[Reservation] Failed to answer ping: {}", e);
                            }
                            continue;
                        }
                        Incoming::Device(payload) => {
                            match events.try_send(FarmEvent::Device(payload)) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    log::warn!("[Reservation] Dropping device event, queue full");
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {
                                    let _ = sink.close().await;
                                    return;
                                }
                            }
                            continue;
                        }
                        Incoming::Disconnected(reason) => reason,
                        Incoming::Ignore => continue,
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => "connection closed by server".to_string(),
                    Some(Err(e)) => format!("WebSocket error: {e}"),
                    Some(Ok(_)) => continue,
                };
                log::warn!("[Reservation] {}", reason);
                let _ = events.send(FarmEvent::Disconnected(reason)).await;
                return;
            }

            request = release_rx.recv() => {
                if let Some(ack) = request {
                    send_farewell(&mut sink).await;
                    let _ = ack.send(());
                } else {
                    let _ = sink.close().await;
                }
                return;
            }
        }
    }
}

async fn send_farewell(sink: &mut SplitSink<Socket, Message>) {
    let frames = [
        packet::encode_event(RELEASE_EVENT, &[Value::String(RELEASE_MESSAGE.into())]),
        packet::encode_disconnect(),
    ];
    for frame in frames {
        if let Err(e) = sink.send(Message::Text(frame)).await {
            log::debug!("[Reservation] Farewell not delivered: {}", e);
            return;
        }
    }
    if let Err(e) = sink.close().await {
        log::debug!("[Reservation] Close failed: {}", e);
    }
}

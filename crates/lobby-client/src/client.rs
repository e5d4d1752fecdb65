//! Connection, request correlation and event subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::COOKIE, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use lobby_core::protocol::{
    api_response_event, inbound, join_room_event, leave_room_event, outbound, sync_ack_event,
    ApiReply, ApiRequest, Frame, RoomRequest, SyncAck, SyncRequest,
};

use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = Result<Value, ClientError>;

/// Request names starting with one of these are superseded by a newer call
/// with the same name.
const READ_VERBS: &[&str] = &[
    "get", "fetch", "load", "is", "has", "list", "all", "search", "view", "retrieve",
];

/// Reply event prefixes. Late replies to aborted calls are dropped instead of
/// reaching subscribers.
const REPLY_PREFIXES: &[&str] = &["apiResponse", "sync", "joinRoom", "leaveRoom"];

pub fn is_read_like(name: &str) -> bool {
    READ_VERBS.iter().any(|verb| name.starts_with(verb))
}

fn is_reply_event(event: &str) -> bool {
    event
        .rsplit_once('-')
        .is_some_and(|(prefix, index)| {
            REPLY_PREFIXES.contains(&prefix) && index.parse::<u64>().is_ok()
        })
}

/// Where the session token travels in the handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TokenPlacement {
    #[default]
    Cookie,
    Query,
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub token_placement: TokenPlacement,
    /// Capacity of the subscriber channel.
    pub event_buffer: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            token_placement: TokenPlacement::Cookie,
            event_buffer: 256,
        }
    }
}

struct Shared {
    /// Reply event name -> waiter.
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    /// Read-like request name -> reply event of the call in flight.
    inflight: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<Frame>,
    /// Set by the reader, under the `pending` lock, once the socket is gone.
    closed: AtomicBool,
}

/// A connected lobby client.
pub struct LobbyClient {
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<Message>,
    next_index: AtomicU64,
    connection_id: String,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LobbyClient {
    pub async fn connect(url: &str, token: &str) -> Result<Self, ClientError> {
        Self::connect_with(url, token, ClientOptions::default()).await
    }

    /// Open the socket and wait for `connection.established`.
    pub async fn connect_with(
        url: &str,
        token: &str,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let request = match options.token_placement {
            TokenPlacement::Cookie => {
                let mut request = url.into_client_request()?;
                let cookie = HeaderValue::from_str(&format!("token={token}"))
                    .map_err(|_| ClientError::InvalidToken)?;
                request.headers_mut().insert(COOKIE, cookie);
                request
            }
            TokenPlacement::Query => format!("{url}?token={token}").into_client_request()?,
        };

        let stream = match connect_async(request).await {
            Ok((stream, _response)) => stream,
            Err(WsError::Http(response)) => {
                return Err(ClientError::Rejected(response.status().as_u16()))
            }
            Err(e) => return Err(e.into()),
        };
        let (sink, mut source) = stream.split();

        let connection_id = tokio::time::timeout(
            options.request_timeout,
            wait_established(&mut source),
        )
        .await
        .map_err(|_| ClientError::Timeout(outbound::CONNECTION_ESTABLISHED.into()))??;
        debug!(connection_id = %connection_id, "connected");

        let (events, _) = broadcast::channel(options.event_buffer.max(1));
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            events,
            closed: AtomicBool::new(false),
        });
        let (outgoing, queue) = mpsc::channel(256);
        let reader = tokio::spawn(read_loop(source, shared.clone()));
        let writer = tokio::spawn(write_loop(sink, queue));

        Ok(Self {
            shared,
            outgoing,
            next_index: AtomicU64::new(0),
            connection_id,
            request_timeout: options.request_timeout,
            reader,
            writer,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Receive every server event that is not a reply to one of our calls.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.shared.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn next_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Call a server API handler.
    ///
    /// Read-like names (`getGames`, `listRooms`, ...) abort any earlier call
    /// with the same name that is still waiting; that call resolves with
    /// [`ClientError::Aborted`].
    pub async fn api_request(&self, name: &str, data: Value) -> Result<ApiReply, ClientError> {
        if name.is_empty() {
            return Err(ClientError::InvalidName);
        }
        let data = if data.is_object() { data } else { json!({}) };
        let index = self.next_index();
        let request = ApiRequest {
            name: Value::String(name.to_string()),
            data,
            response_index: Some(index),
        };
        let abort_key = is_read_like(name).then_some(name);
        let reply = self
            .call(
                inbound::API_REQUEST,
                api_response_event(index),
                serde_json::to_value(&request)?,
                abort_key,
            )
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Run a sync call against `receiver` (a room, or `"all"`).
    pub async fn sync_request(
        &self,
        name: &str,
        data: Value,
        receiver: &str,
        ignore_self: bool,
    ) -> Result<SyncAck, ClientError> {
        let index = self.next_index();
        let request = SyncRequest {
            name: Value::String(name.to_string()),
            data,
            cb: Value::String(name.to_string()),
            receiver: Value::String(receiver.to_string()),
            response_index: Some(index),
            ignore_self,
        };
        let reply = self
            .call(
                inbound::SYNC,
                sync_ack_event(index),
                serde_json::to_value(&request)?,
                None,
            )
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn join_room(&self, group: &str) -> Result<(), ClientError> {
        let index = self.next_index();
        let request = RoomRequest {
            group: group.to_string(),
            response_index: Some(index),
        };
        self.call(
            inbound::JOIN_ROOM,
            join_room_event(index),
            serde_json::to_value(&request)?,
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn leave_room(&self, group: &str) -> Result<(), ClientError> {
        let index = self.next_index();
        let request = RoomRequest {
            group: group.to_string(),
            response_index: Some(index),
        };
        self.call(
            inbound::LEAVE_ROOM,
            leave_room_event(index),
            serde_json::to_value(&request)?,
            None,
        )
        .await?;
        Ok(())
    }

    /// Report a navigation. No reply is sent.
    pub async fn update_location(
        &self,
        path_name: &str,
        search_params: Map<String, Value>,
    ) -> Result<(), ClientError> {
        let data = json!({ "pathName": path_name, "searchParams": search_params });
        self.send(Frame::new(inbound::UPDATE_LOCATION, data)).await
    }

    /// Tell the server this tab is going away on purpose.
    pub async fn intentional_disconnect(&self) -> Result<(), ClientError> {
        self.send(Frame::new(inbound::INTENTIONAL_DISCONNECT, Value::Null))
            .await
    }

    /// Send a close frame and wait briefly for the server to hang up.
    pub async fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None)).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !self.reader.is_finished() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), ClientError> {
        self.outgoing
            .send(Message::text(frame.to_text()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    async fn call(
        &self,
        event: &str,
        reply_event: String,
        data: Value,
        abort_key: Option<&str>,
    ) -> Reply {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(ClientError::Closed);
            }
            pending.insert(reply_event.clone(), tx);
        }

        if let Some(key) = abort_key {
            let previous = self
                .shared
                .inflight
                .lock()
                .insert(key.to_string(), reply_event.clone());
            if let Some(previous) = previous {
                if let Some(waiter) = self.shared.pending.lock().remove(&previous) {
                    debug!(name = key, "aborting superseded request");
                    let _ = waiter.send(Err(ClientError::Aborted(key.to_string())));
                }
            }
        }

        if let Err(e) = self.send(Frame::new(event, data)).await {
            self.shared.pending.lock().remove(&reply_event);
            return Err(e);
        }

        let outcome = tokio::time::timeout(self.request_timeout, rx).await;

        if let Some(key) = abort_key {
            let mut inflight = self.shared.inflight.lock();
            if inflight.get(key) == Some(&reply_event) {
                inflight.remove(key);
            }
        }

        match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.shared.pending.lock().remove(&reply_event);
                Err(ClientError::Timeout(reply_event))
            }
        }
    }
}

impl Drop for LobbyClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn frame_text(msg: Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text.as_str().to_string()),
        Message::Binary(data) => String::from_utf8(data.to_vec()).ok(),
        _ => None,
    }
}

async fn wait_established(source: &mut SplitStream<WsStream>) -> Result<String, ClientError> {
    while let Some(msg) = source.next().await {
        let msg = msg?;
        if matches!(msg, Message::Close(_)) {
            return Err(ClientError::Closed);
        }
        let Some(text) = frame_text(msg) else {
            continue;
        };
        match Frame::parse(&text) {
            Ok(frame) if frame.event == outbound::CONNECTION_ESTABLISHED => {
                let id = frame
                    .data
                    .get("connectionId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return Ok(id);
            }
            Ok(frame) => debug!(event = %frame.event, "frame before handshake dropped"),
            Err(e) => warn!(error = %e, "unparseable frame"),
        }
    }
    Err(ClientError::Closed)
}

async fn read_loop(mut source: SplitStream<WsStream>, shared: Arc<Shared>) {
    while let Some(msg) = source.next().await {
        let msg = match msg {
            Ok(Message::Close(_)) => break,
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        };
        let Some(text) = frame_text(msg) else {
            continue;
        };
        let frame = match Frame::parse(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "unparseable frame");
                continue;
            }
        };

        let waiter = shared.pending.lock().remove(&frame.event);
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(frame.data));
        } else if is_reply_event(&frame.event) {
            debug!(event = %frame.event, "late reply dropped");
        } else {
            let _ = shared.events.send(frame);
        }
    }
    // Waiters see a dropped sender and resolve with `Closed`.
    let mut pending = shared.pending.lock();
    shared.closed.store(true, Ordering::Release);
    pending.clear();
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut queue: mpsc::Receiver<Message>) {
    while let Some(msg) = queue.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!(error = %e, "websocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
}

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::protocol::{
    decode_server_frame, encode_client_message, ClientMessage, MessageKind, ServerEnvelope,
};
use super::socket::SignalingSocket;
use super::SignalingError;

pub const MAX_PENDING_REQUESTS: usize = 16;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What happens to a frame once a waiter matches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// The waiter consumes the frame.
    Claim,
    /// The waiter gets a copy and the frame still reaches the notification
    /// stream.
    Observe,
}

struct PendingRequest {
    id: u64,
    expected: MessageKind,
    mode: MatchMode,
    reply: oneshot::Sender<ServerEnvelope>,
}

#[derive(Default)]
struct PendingTable {
    next_id: u64,
    entries: Vec<PendingRequest>,
}

impl PendingTable {
    fn insert(
        &mut self,
        expected: MessageKind,
        mode: MatchMode,
        reply: oneshot::Sender<ServerEnvelope>,
    ) -> Result<u64, SignalingError> {
        if self.entries.len() >= MAX_PENDING_REQUESTS {
            return Err(SignalingError::TooManyPending(MAX_PENDING_REQUESTS));
        }
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        self.entries.push(PendingRequest {
            id,
            expected,
            mode,
            reply,
        });
        Ok(id)
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        before != self.entries.len()
    }

    /// Newest matching waiter first. Waiters whose receiver is gone are
    /// skipped so the frame can still find a live one.
    fn resolve(&mut self, envelope: &ServerEnvelope) -> Option<MatchMode> {
        let kind = envelope.kind();
        while let Some(idx) = self.entries.iter().rposition(|entry| entry.expected == kind) {
            let entry = self.entries.remove(idx);
            if entry.reply.send(envelope.clone()).is_ok() {
                return Some(entry.mode);
            }
            log::debug!("signaling waiter {} for {kind} was abandoned", entry.id);
        }
        None
    }

    fn close_all(&mut self) {
        self.entries.clear();
    }
}

fn lock_table(table: &Mutex<PendingTable>) -> MutexGuard<'_, PendingTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops the table entry if the waiting future goes away before a reply.
struct PendingGuard<'a> {
    table: &'a Mutex<PendingTable>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_table(self.table).remove(self.id);
    }
}

pub struct Multiplexer;

impl Multiplexer {
    /// Spawns the loop that owns `socket`. Frames no request claims come
    /// out of the returned receiver.
    pub fn start<S: SignalingSocket>(
        socket: S,
        request_timeout: Duration,
    ) -> (SignalingClient, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (room_tx, room_rx) = watch::channel(None);
        let pending = Arc::new(Mutex::new(PendingTable::default()));

        let worker = tokio::spawn(run_signaling_loop(
            socket,
            outbound_rx,
            Arc::clone(&pending),
            notify_tx,
            room_tx,
        ));

        let client = SignalingClient {
            outbound: outbound_tx,
            pending,
            server_room: room_rx,
            request_timeout,
            worker: Arc::new(worker),
        };
        (client, notify_rx)
    }
}

#[derive(Clone)]
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<PendingTable>>,
    server_room: watch::Receiver<Option<String>>,
    request_timeout: Duration,
    worker: Arc<JoinHandle<()>>,
}

impl SignalingClient {
    pub async fn request(
        &self,
        message: ClientMessage,
        expected: MessageKind,
        mode: MatchMode,
    ) -> Result<ServerEnvelope, SignalingError> {
        let text = encode_client_message(&message)?;
        let (reply_tx, reply_rx) = oneshot::channel();

        // Registered before sending so an immediate reply cannot slip past.
        let id = lock_table(&self.pending).insert(expected, mode, reply_tx)?;
        let _guard = PendingGuard {
            table: &self.pending,
            id,
        };

        self.outbound
            .send(text)
            .map_err(|_| SignalingError::Closed)?;

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(SignalingError::Closed),
            Err(_) => Err(SignalingError::Timeout {
                expected,
                after: self.request_timeout,
            }),
        }
    }

    /// Fire-and-forget.
    pub fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        let text = encode_client_message(&message)?;
        self.outbound
            .send(text)
            .map_err(|_| SignalingError::Closed)
    }

    pub async fn channel_prefix(&self, demo_group_name: &str) -> Result<String, SignalingError> {
        let reply = self
            .request(
                ClientMessage::GetChannelPrefix {
                    demo_group_name: demo_group_name.to_string(),
                },
                MessageKind::SetChannelPrefix,
                MatchMode::Claim,
            )
            .await?;
        match reply.body {
            super::ServerMessage::SetChannelPrefix { channel_prefix } => Ok(channel_prefix),
            other => Err(SignalingError::UnexpectedReply(other.kind())),
        }
    }

    /// Asks for the current room. The `join-room` answer is observed, not
    /// claimed, so seat assignment still runs through the notification
    /// stream.
    pub async fn current_room(&self) -> Result<Option<String>, SignalingError> {
        let reply = self
            .request(
                ClientMessage::GetCurrentRoom {},
                MessageKind::JoinRoom,
                MatchMode::Observe,
            )
            .await?;
        Ok(reply.room)
    }

    pub async fn agora_token(
        &self,
        uid: &str,
        channel_name: &str,
        token_role: u32,
    ) -> Result<String, SignalingError> {
        let reply = self
            .request(
                ClientMessage::GetAgoraToken {
                    uid: uid.to_string(),
                    agora_channel_name: channel_name.to_string(),
                    token_role,
                },
                MessageKind::NewAgoraToken,
                MatchMode::Claim,
            )
            .await?;
        match reply.body {
            super::ServerMessage::NewAgoraToken { token } => Ok(token),
            other => Err(SignalingError::UnexpectedReply(other.kind())),
        }
    }

    pub fn server_room(&self) -> Option<String> {
        self.server_room.borrow().clone()
    }

    pub fn pending_requests(&self) -> usize {
        lock_table(&self.pending).entries.len()
    }

    pub fn is_open(&self) -> bool {
        !self.worker.is_finished()
    }
}

enum LoopEvent {
    Outbound(Option<String>),
    Inbound(Option<Result<String, SignalingError>>),
}

async fn run_signaling_loop<S: SignalingSocket>(
    mut socket: S,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    pending: Arc<Mutex<PendingTable>>,
    notifications: mpsc::UnboundedSender<ServerEnvelope>,
    server_room: watch::Sender<Option<String>>,
) {
    loop {
        let event = tokio::select! {
            text = outbound_rx.recv() => LoopEvent::Outbound(text),
            frame = socket.recv() => LoopEvent::Inbound(frame),
        };

        match event {
            LoopEvent::Outbound(None) => break,
            LoopEvent::Outbound(Some(text)) => {
                if let Err(err) = socket.send(text).await {
                    log::warn!("signaling send failed: {err}");
                    break;
                }
            }
            LoopEvent::Inbound(None) => {
                log::info!("signaling connection closed by server");
                break;
            }
            LoopEvent::Inbound(Some(Err(err))) => {
                log::warn!("signaling connection failed: {err}");
                break;
            }
            LoopEvent::Inbound(Some(Ok(raw))) => {
                let envelope = match decode_server_frame(&raw) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        log::warn!("ignoring unparseable signaling frame: {err}");
                        continue;
                    }
                };
                dispatch(envelope, &pending, &notifications, &server_room);
            }
        }
    }

    lock_table(&pending).close_all();
    if let Err(err) = socket.close().await {
        log::debug!("signaling close: {err}");
    }
}

fn dispatch(
    envelope: ServerEnvelope,
    pending: &Mutex<PendingTable>,
    notifications: &mpsc::UnboundedSender<ServerEnvelope>,
    server_room: &watch::Sender<Option<String>>,
) {
    if let Some(room) = envelope.room.as_ref() {
        server_room.send_replace(Some(room.clone()));
    }

    let matched = lock_table(pending).resolve(&envelope);
    let forward = match matched {
        Some(MatchMode::Claim) => false,
        Some(MatchMode::Observe) => true,
        None => {
            log::debug!("no waiter for {}; forwarding", envelope.kind());
            true
        }
    };

    if forward && notifications.send(envelope).is_err() {
        log::debug!("notification stream dropped; frame discarded");
    }
}

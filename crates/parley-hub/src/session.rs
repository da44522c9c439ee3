use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use parley_db::{AppendReceipt, Database, MessageTarget};
use parley_types::wire::WireMessage;

use crate::hub::{Hub, SessionHandle};

/// One connected user's live socket. The session owns the socket exclusively;
/// the hub only ever holds the outbound frame channel.
pub struct Session {
    user_id: String,
    username: String,
    conn_id: Uuid,
    socket: WebSocket,
    outbound_rx: mpsc::UnboundedReceiver<WireMessage>,
    hub: Hub,
    db: Arc<Database>,
}

impl Session {
    /// Built by the session-establishment layer after an authenticated
    /// upgrade; `user_id`/`username` come from the verified claims. The
    /// returned handle is what that layer submits to the hub's Join intake.
    /// The session never registers itself.
    pub fn new(
        user_id: String,
        username: String,
        socket: WebSocket,
        hub: Hub,
        db: Arc<Database>,
    ) -> (Self, SessionHandle) {
        let conn_id = Uuid::new_v4();
        let (handle, outbound_rx) = SessionHandle::new(username.clone(), conn_id);
        (
            Self {
                user_id,
                username,
                conn_id,
                socket,
                outbound_rx,
                hub,
                db,
            },
            handle,
        )
    }

    /// Drive the socket until it closes or the hub replaces this session.
    /// The departure notification on the way out is unconditional; the hub
    /// ignores it if a newer session took over.
    pub async fn run(self) {
        let Session {
            user_id,
            username,
            conn_id,
            socket,
            outbound_rx,
            hub,
            db,
        } = self;

        let (sink, stream) = socket.split();

        info!("{} connected", username);

        let mut writer = tokio::spawn(write_loop(sink, outbound_rx, username.clone()));
        let mut reader = tokio::spawn(read_loop(
            stream,
            user_id,
            username.clone(),
            hub.clone(),
            db,
        ));

        // The writer ends when the hub drops this session's handle (rejoin
        // replacement); the reader ends on socket close or error. Either way
        // the whole session winds down and the socket drops closed.
        tokio::select! {
            _ = &mut writer => reader.abort(),
            _ = &mut reader => writer.abort(),
        }

        hub.leave(&username, conn_id).await;
        info!("{} disconnected", username);
    }
}

/// Read frames until the socket closes. Per frame: decode, persist, forward.
/// Decode and persistence failures drop that frame and keep the loop alive;
/// only transport errors end it.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    user_id: String,
    username: String,
    hub: Hub,
    db: Arc<Database>,
) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                info!("{}: connection closed by client", username);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("{}: read failed: {}", username, e);
                break;
            }
        };

        let inbound: WireMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("{}: dropping undecodable frame: {}", username, e);
                continue;
            }
        };

        let Some(target) = resolve_target(&inbound) else {
            warn!(
                "{}: frame names neither a conversation nor a receiver, dropped",
                username
            );
            continue;
        };

        // rusqlite is synchronous; keep it off the async workers.
        let db = db.clone();
        let author_id = user_id.clone();
        let body = inbound.body.clone();
        let receipt =
            match tokio::task::spawn_blocking(move || db.append_message(&author_id, &body, target))
                .await
            {
                Ok(Ok(receipt)) => receipt,
                Ok(Err(e)) => {
                    // The message is dropped, not retried; the client gets no
                    // error frame.
                    error!("{}: message not persisted: {}", username, e);
                    continue;
                }
                Err(e) => {
                    error!("{}: persistence task panicked: {}", username, e);
                    continue;
                }
            };

        hub.broadcast(stamp_outbound(inbound, &username, receipt)).await;
    }
}

/// Serialize and write queued frames. A failed write loses that frame only;
/// closing the socket is the read loop's call.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<WireMessage>,
    username: String,
) {
    while let Some(msg) = outbound.recv().await {
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                warn!("{}: unserializable outbound frame: {}", username, e);
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(json.into())).await {
            warn!("{}: write failed: {}", username, e);
        }
    }
}

/// An inbound frame must name an existing conversation or a receiver to
/// resolve one from. Anything else is a malformed client frame.
fn resolve_target(msg: &WireMessage) -> Option<MessageTarget> {
    match (msg.conversation_id, msg.receiver.as_ref()) {
        (Some(id), _) => Some(MessageTarget::Conversation(id)),
        (None, Some(receiver)) => Some(MessageTarget::Receiver(receiver.clone())),
        (None, None) => None,
    }
}

/// The outbound frame the hub fans out: the client's body and receiver, the
/// session's authenticated username as sender, and the ids the persistence
/// transaction handed back.
fn stamp_outbound(inbound: WireMessage, username: &str, receipt: AppendReceipt) -> WireMessage {
    WireMessage {
        id: Some(receipt.message_id),
        body: inbound.body,
        sender: Some(username.to_string()),
        receiver: inbound.receiver,
        conversation_id: Some(receipt.conversation_id),
        created_at: Some(receipt.created_at),
    }
}

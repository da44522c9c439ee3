use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use parley_types::wire::WireMessage;

/// Capacity of the hub intake queue. A session awaiting a slot here is the
/// system's only backpressure.
const INTAKE_CAPACITY: usize = 256;

/// What the hub holds for one live session: identity plus the outbound frame
/// channel. The socket itself never leaves the session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub username: String,
    pub conn_id: Uuid,
    outbound: mpsc::UnboundedSender<WireMessage>,
}

impl SessionHandle {
    pub fn new(username: String, conn_id: Uuid) -> (Self, mpsc::UnboundedReceiver<WireMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                username,
                conn_id,
                outbound,
            },
            rx,
        )
    }

    /// Queue one frame for this session's writer. A writer that already went
    /// away just loses the frame.
    fn deliver(&self, msg: WireMessage) {
        let _ = self.outbound.send(msg);
    }
}

enum HubCommand {
    Join(SessionHandle),
    Leave { username: String, conn_id: Uuid },
    Broadcast(WireMessage),
}

/// Handle to the hub worker task. All registry access goes through the intake
/// queue and a single consumer applies one command at a time, so the order
/// commands are submitted is the order every session observes.
#[derive(Clone)]
pub struct Hub {
    intake: mpsc::Sender<HubCommand>,
}

impl Hub {
    /// Spawn the worker that owns the registry and hand back the intake side.
    pub fn spawn() -> Self {
        let (intake, rx) = mpsc::channel(INTAKE_CAPACITY);
        tokio::spawn(run(rx));
        Self { intake }
    }

    pub async fn join(&self, session: SessionHandle) {
        let _ = self.intake.send(HubCommand::Join(session)).await;
    }

    pub async fn leave(&self, username: &str, conn_id: Uuid) {
        let _ = self
            .intake
            .send(HubCommand::Leave {
                username: username.to_string(),
                conn_id,
            })
            .await;
    }

    pub async fn broadcast(&self, msg: WireMessage) {
        let _ = self.intake.send(HubCommand::Broadcast(msg)).await;
    }
}

async fn run(mut intake: mpsc::Receiver<HubCommand>) {
    let mut registry: HashMap<String, SessionHandle> = HashMap::new();

    info!("hub running");
    while let Some(cmd) = intake.recv().await {
        match cmd {
            HubCommand::Join(session) => join(&mut registry, session),
            HubCommand::Leave { username, conn_id } => leave(&mut registry, &username, conn_id),
            HubCommand::Broadcast(msg) => broadcast(&registry, &msg),
        }
    }
}

fn join(registry: &mut HashMap<String, SessionHandle>, session: SessionHandle) {
    let username = session.username.clone();

    // Rejoin replaces the stale session: dropping its handle here closes its
    // outbound channel, which ends its writer and with it the old socket.
    // The user never went offline, so no presence event goes out.
    if registry.insert(username.clone(), session).is_some() {
        info!("{} rejoined, stale session replaced", username);
        return;
    }

    info!("{} is online", username);
    broadcast(registry, &WireMessage::presence(&username, true));
}

fn leave(registry: &mut HashMap<String, SessionHandle>, username: &str, conn_id: Uuid) {
    // Only the session that owns the registry entry may remove it; a stale
    // session departing after being replaced must not evict its successor.
    // Leaving an unregistered username is a no-op.
    match registry.get(username) {
        Some(current) if current.conn_id == conn_id => {
            registry.remove(username);
            info!("{} is offline", username);
            broadcast(registry, &WireMessage::presence(username, false));
        }
        _ => {}
    }
}

fn broadcast(registry: &HashMap<String, SessionHandle>, msg: &WireMessage) {
    // No receiver: presence/system event, fan out to every live session.
    let Some(receiver) = msg.receiver.as_deref() else {
        for session in registry.values() {
            session.deliver(msg.clone());
        }
        return;
    };

    // Echo to the sender's own session, then to the receiver's, each only if
    // live. An offline target is dropped silently, never queued.
    if let Some(session) = msg.sender.as_deref().and_then(|s| registry.get(s)) {
        session.deliver(msg.clone());
    }
    if let Some(session) = registry.get(receiver) {
        session.deliver(msg.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_msg(body: &str, sender: &str, receiver: &str) -> WireMessage {
        WireMessage {
            id: Some(Uuid::new_v4()),
            body: body.to_string(),
            sender: Some(sender.to_string()),
            receiver: Some(receiver.to_string()),
            conversation_id: Some(Uuid::new_v4()),
            created_at: None,
        }
    }

    /// Drain `rx` until the probe body shows up, returning everything seen
    /// before it. Because the hub is a single consumer, once the probe is
    /// delivered every earlier command has been applied.
    async fn drain_until(
        rx: &mut mpsc::UnboundedReceiver<WireMessage>,
        probe: &str,
    ) -> Vec<WireMessage> {
        let mut seen = Vec::new();
        while let Some(msg) = rx.recv().await {
            if msg.body == probe {
                return seen;
            }
            seen.push(msg);
        }
        panic!("channel closed before probe {probe:?}");
    }

    async fn probe(hub: &Hub, label: &str) {
        let mut msg = WireMessage::presence("probe", true);
        msg.body = label.to_string();
        msg.sender = None;
        hub.broadcast(msg).await;
    }

    #[tokio::test]
    async fn global_broadcast_reaches_everyone_including_sender() {
        let hub = Hub::spawn();
        let (alice, mut alice_rx) = SessionHandle::new("alice".into(), Uuid::new_v4());
        let (bob, mut bob_rx) = SessionHandle::new("bob".into(), Uuid::new_v4());
        hub.join(alice).await;
        hub.join(bob).await;

        let mut global = WireMessage::presence("system", true);
        global.body = "announcement".into();
        global.sender = Some("alice".into());
        hub.broadcast(global).await;

        probe(&hub, "end").await;
        let alice_saw = drain_until(&mut alice_rx, "end").await;
        let bob_saw = drain_until(&mut bob_rx, "end").await;

        assert!(alice_saw.iter().any(|m| m.body == "announcement"));
        assert!(bob_saw.iter().any(|m| m.body == "announcement"));
    }

    #[tokio::test]
    async fn join_broadcasts_online_presence_to_all() {
        let hub = Hub::spawn();
        let (alice, mut alice_rx) = SessionHandle::new("alice".into(), Uuid::new_v4());
        hub.join(alice).await;
        let (bob, _bob_rx) = SessionHandle::new("bob".into(), Uuid::new_v4());
        hub.join(bob).await;

        probe(&hub, "end").await;
        let seen = drain_until(&mut alice_rx, "end").await;

        // Alice sees her own online event, then bob's.
        assert_eq!(seen[0].body, "alice is online");
        assert_eq!(seen[0].sender.as_deref(), Some("alice"));
        assert!(seen[0].receiver.is_none());
        assert!(seen[0].conversation_id.is_none());
        assert_eq!(seen[1].body, "bob is online");
    }

    #[tokio::test]
    async fn targeted_broadcast_goes_to_sender_and_receiver_only() {
        let hub = Hub::spawn();
        let (alice, mut alice_rx) = SessionHandle::new("alice".into(), Uuid::new_v4());
        let (bob, mut bob_rx) = SessionHandle::new("bob".into(), Uuid::new_v4());
        let (carol, mut carol_rx) = SessionHandle::new("carol".into(), Uuid::new_v4());
        hub.join(alice).await;
        hub.join(bob).await;
        hub.join(carol).await;

        hub.broadcast(chat_msg("hi bob", "alice", "bob")).await;

        probe(&hub, "end").await;
        assert!(drain_until(&mut alice_rx, "end")
            .await
            .iter()
            .any(|m| m.body == "hi bob"));
        assert!(drain_until(&mut bob_rx, "end")
            .await
            .iter()
            .any(|m| m.body == "hi bob"));
        assert!(!drain_until(&mut carol_rx, "end")
            .await
            .iter()
            .any(|m| m.body == "hi bob"));
    }

    #[tokio::test]
    async fn offline_receiver_is_dropped_not_queued() {
        let hub = Hub::spawn();
        let (alice, mut alice_rx) = SessionHandle::new("alice".into(), Uuid::new_v4());
        hub.join(alice).await;

        hub.broadcast(chat_msg("hi bob", "alice", "bob")).await;

        // Bob joins after the fact and must not see the earlier message.
        let (bob, mut bob_rx) = SessionHandle::new("bob".into(), Uuid::new_v4());
        hub.join(bob).await;

        probe(&hub, "end").await;
        assert!(drain_until(&mut alice_rx, "end")
            .await
            .iter()
            .any(|m| m.body == "hi bob"));
        assert!(!drain_until(&mut bob_rx, "end")
            .await
            .iter()
            .any(|m| m.body == "hi bob"));
    }

    #[tokio::test]
    async fn leave_closes_the_session_and_announces_offline() {
        let hub = Hub::spawn();
        let alice_conn = Uuid::new_v4();
        let (alice, mut alice_rx) = SessionHandle::new("alice".into(), alice_conn);
        let (bob, mut bob_rx) = SessionHandle::new("bob".into(), Uuid::new_v4());
        hub.join(alice).await;
        hub.join(bob).await;

        hub.leave("alice", alice_conn).await;
        // Submitted after the leave, so it must never reach alice's session.
        hub.broadcast(chat_msg("too late", "bob", "alice")).await;

        probe(&hub, "end").await;
        let bob_saw = drain_until(&mut bob_rx, "end").await;
        assert!(bob_saw.iter().any(|m| m.body == "alice is offline"));

        // Alice's channel was dropped by the hub: she received nothing after
        // her removal and the channel is now closed.
        let mut alice_saw = Vec::new();
        while let Some(msg) = alice_rx.recv().await {
            alice_saw.push(msg.body);
        }
        assert!(!alice_saw.contains(&"too late".to_string()));
        assert!(!alice_saw.contains(&"alice is offline".to_string()));
    }

    #[tokio::test]
    async fn leaving_an_unregistered_username_is_a_noop() {
        let hub = Hub::spawn();
        let (alice, mut alice_rx) = SessionHandle::new("alice".into(), Uuid::new_v4());
        hub.join(alice).await;

        hub.leave("ghost", Uuid::new_v4()).await;

        probe(&hub, "end").await;
        let seen = drain_until(&mut alice_rx, "end").await;
        assert!(!seen.iter().any(|m| m.body.contains("offline")));
    }

    #[tokio::test]
    async fn rejoin_replaces_the_stale_session() {
        let hub = Hub::spawn();
        let old_conn = Uuid::new_v4();
        let (old, mut old_rx) = SessionHandle::new("alice".into(), old_conn);
        hub.join(old).await;

        let new_conn = Uuid::new_v4();
        let (new, mut new_rx) = SessionHandle::new("alice".into(), new_conn);
        hub.join(new).await;

        hub.broadcast(chat_msg("after rejoin", "bob", "alice")).await;

        probe(&hub, "end").await;
        let new_saw = drain_until(&mut new_rx, "end").await;
        assert!(new_saw.iter().any(|m| m.body == "after rejoin"));
        // Exactly one online event: the user never went offline.
        assert_eq!(
            new_saw.iter().filter(|m| m.body == "alice is online").count(),
            0,
            "replacement join must not re-announce presence"
        );

        // The old channel is closed and never saw the post-rejoin message.
        let mut old_saw = Vec::new();
        while let Some(msg) = old_rx.recv().await {
            old_saw.push(msg.body);
        }
        assert!(old_saw.contains(&"alice is online".to_string()));
        assert!(!old_saw.contains(&"after rejoin".to_string()));
    }

    #[tokio::test]
    async fn stale_leave_cannot_evict_the_replacement() {
        let hub = Hub::spawn();
        let old_conn = Uuid::new_v4();
        let (old, _old_rx) = SessionHandle::new("alice".into(), old_conn);
        hub.join(old).await;

        let (new, mut new_rx) = SessionHandle::new("alice".into(), Uuid::new_v4());
        hub.join(new).await;

        // The replaced session's read loop exits and files its departure.
        hub.leave("alice", old_conn).await;
        hub.broadcast(chat_msg("still here", "bob", "alice")).await;

        probe(&hub, "end").await;
        let seen = drain_until(&mut new_rx, "end").await;
        assert!(seen.iter().any(|m| m.body == "still here"));
        assert!(!seen.iter().any(|m| m.body == "alice is offline"));
    }
}

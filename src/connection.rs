//! Connection manager: owns the WebSocket session, keep-alive, reconnect
//! backoff, and subscription send/replay.

use crate::config::ConnectionConfig;
use crate::error::LiveStackError;
use crate::frame::{self, Frame};
use crate::registry::SubscriptionSink;
use crate::subscription::{ClientMessage, Subscription, SubscriptionSet, Unsubscription};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Error,
}

enum Command {
    Connect(oneshot::Sender<Result<(), LiveStackError>>),
    Subscribe(Subscription),
    Unsubscribe(Unsubscription),
    ClearSubscriptions,
    Disconnect,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Capacity of the frame fan-out channel. Matches the store backlog policy:
/// a lagging observer loses the oldest frames, never the session.
const FRAME_CHANNEL_CAPACITY: usize = 1_000;
const STATE_CHANNEL_CAPACITY: usize = 64;

struct ConnectionManagerInner {
    state: Arc<RwLock<ConnectionState>>,
    command_tx: mpsc::UnboundedSender<Command>,
    state_tx: broadcast::Sender<ConnectionState>,
    frame_tx: broadcast::Sender<Frame>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionManagerInner>,
}

impl ConnectionManager {
    pub fn new(url: String, config: ConnectionConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (frame_tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);

        spawn_connection_loop(
            url,
            config,
            state.clone(),
            state_tx.clone(),
            frame_tx.clone(),
            command_rx,
        );

        Self {
            inner: Arc::new(ConnectionManagerInner {
                state,
                command_tx,
                state_tx,
                frame_tx,
            }),
        }
    }

    /// Opens the transport. Resolves once the socket is up, or fails if the
    /// initial attempt does; later automatic reconnects never touch this
    /// call's outcome.
    pub async fn connect(&self) -> Result<(), LiveStackError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(Command::Connect(ack_tx))
            .map_err(|_| LiveStackError::ConnectionClosed)?;
        ack_rx
            .await
            .map_err(|_| LiveStackError::ConnectionClosed)?
    }

    /// Closes the transport and cancels keep-alive and any pending
    /// reconnect. The active-subscription set is preserved.
    pub fn disconnect(&self) {
        let _ = self.inner.command_tx.send(Command::Disconnect);
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Observes state transitions. Decode failures surface here as an
    /// `Error` observation while the session stays alive.
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Observes every decoded frame, in transport order.
    pub fn frames(&self) -> broadcast::Receiver<Frame> {
        self.inner.frame_tx.subscribe()
    }

    pub fn subscribe(&self, sub: Subscription) {
        let _ = self.inner.command_tx.send(Command::Subscribe(sub));
    }

    pub fn unsubscribe(&self, unsub: Unsubscription) {
        let _ = self.inner.command_tx.send(Command::Unsubscribe(unsub));
    }

    /// Drops every queued and active subscription without wire traffic.
    /// Called by the owning client on teardown, after the registry has
    /// issued its unsubscribes.
    pub fn clear_subscriptions(&self) {
        let _ = self.inner.command_tx.send(Command::ClearSubscriptions);
    }
}

impl SubscriptionSink for ConnectionManager {
    fn send_subscribe(&self, sub: Subscription) {
        self.subscribe(sub);
    }

    fn send_unsubscribe(&self, unsub: Unsubscription) {
        self.unsubscribe(unsub);
    }
}

fn spawn_connection_loop(
    url: String,
    config: ConnectionConfig,
    state: Arc<RwLock<ConnectionState>>,
    state_tx: broadcast::Sender<ConnectionState>,
    frame_tx: broadcast::Sender<Frame>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    tokio::spawn(async move {
        let mut active = SubscriptionSet::new();
        let mut pending: VecDeque<Subscription> = VecDeque::new();

        let set_state = |next: ConnectionState| {
            let state = state.clone();
            let state_tx = state_tx.clone();
            async move {
                *state.write().await = next;
                let _ = state_tx.send(next);
            }
        };

        'idle: loop {
            // Wait for an explicit connect; subscription intents queue up.
            let ack = loop {
                match command_rx.recv().await {
                    Some(Command::Connect(ack)) => break ack,
                    Some(Command::Subscribe(sub)) => {
                        queue_subscription(&mut pending, &active, sub);
                    }
                    Some(Command::Unsubscribe(unsub)) => {
                        active.remove_matching(&unsub);
                        pending.retain(|s| !(s.view == unsub.view && s.key == unsub.key));
                    }
                    Some(Command::ClearSubscriptions) => {
                        active.clear();
                        pending.clear();
                    }
                    Some(Command::Disconnect) => {
                        set_state(ConnectionState::Disconnected).await;
                    }
                    None => return,
                }
            };

            let mut connect_ack = Some(ack);
            let mut attempt: u32 = 0;

            'session: loop {
                set_state(ConnectionState::Connecting).await;

                match connect_async(url.as_str()).await {
                    Ok((ws, _)) => {
                        set_state(ConnectionState::Connected).await;
                        attempt = 0;
                        if let Some(ack) = connect_ack.take() {
                            let _ = ack.send(Ok(()));
                        }

                        let (mut ws_tx, mut ws_rx) = ws.split();

                        // Server-side state is gone after a disconnect:
                        // drain the queue, then replay the active set in
                        // first-subscribe order.
                        let replay = active.all();
                        while let Some(sub) = pending.pop_front() {
                            if active.add(sub.clone()) {
                                send_client_message(&mut ws_tx, &ClientMessage::Subscribe(sub))
                                    .await;
                            }
                        }
                        for sub in replay {
                            send_client_message(&mut ws_tx, &ClientMessage::Subscribe(sub)).await;
                        }

                        let mut ping_timer = tokio::time::interval(config.ping_interval);
                        ping_timer.tick().await;

                        let requested_disconnect = loop {
                            tokio::select! {
                                msg = ws_rx.next() => {
                                    match msg {
                                        Some(Ok(Message::Text(text))) => {
                                            dispatch_payload(&frame_tx, &state_tx, frame::decode_text(&text));
                                        }
                                        Some(Ok(Message::Binary(bytes))) => {
                                            dispatch_payload(&frame_tx, &state_tx, frame::decode_binary(&bytes));
                                        }
                                        Some(Ok(Message::Ping(payload))) => {
                                            let _ = ws_tx.send(Message::Pong(payload)).await;
                                        }
                                        Some(Ok(Message::Close(_))) | None => {
                                            break false;
                                        }
                                        Some(Err(e)) => {
                                            tracing::warn!("WebSocket error: {}", e);
                                            set_state(ConnectionState::Error).await;
                                            break false;
                                        }
                                        _ => {}
                                    }
                                }
                                cmd = command_rx.recv() => {
                                    match cmd {
                                        Some(Command::Subscribe(sub)) => {
                                            if active.add(sub.clone()) {
                                                send_client_message(&mut ws_tx, &ClientMessage::Subscribe(sub)).await;
                                            }
                                        }
                                        Some(Command::Unsubscribe(unsub)) => {
                                            if active.contains_matching(&unsub) {
                                                send_client_message(&mut ws_tx, &ClientMessage::Unsubscribe(unsub.clone())).await;
                                            }
                                            active.remove_matching(&unsub);
                                        }
                                        Some(Command::ClearSubscriptions) => {
                                            active.clear();
                                            pending.clear();
                                        }
                                        Some(Command::Connect(ack)) => {
                                            let _ = ack.send(Ok(()));
                                        }
                                        Some(Command::Disconnect) => {
                                            let _ = ws_tx.close().await;
                                            break true;
                                        }
                                        None => {
                                            let _ = ws_tx.close().await;
                                            break true;
                                        }
                                    }
                                }
                                _ = ping_timer.tick() => {
                                    send_client_message(&mut ws_tx, &ClientMessage::Ping).await;
                                }
                            }
                        };

                        if requested_disconnect {
                            set_state(ConnectionState::Disconnected).await;
                            continue 'idle;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Connection failed: {}", e);
                        set_state(ConnectionState::Error).await;
                        if let Some(ack) = connect_ack.take() {
                            let _ = ack
                                .send(Err(LiveStackError::ConnectionFailed(e.to_string())));
                        }
                    }
                }

                // Session lost or attempt failed.
                if !config.auto_reconnect {
                    set_state(ConnectionState::Error).await;
                    continue 'idle;
                }
                if attempt >= config.max_reconnect_attempts {
                    tracing::error!(
                        "Giving up after {} reconnect attempts",
                        config.max_reconnect_attempts
                    );
                    set_state(ConnectionState::Error).await;
                    continue 'idle;
                }

                let delay = config
                    .reconnect_intervals
                    .get(attempt as usize)
                    .or_else(|| config.reconnect_intervals.last())
                    .copied()
                    .unwrap_or_else(|| std::time::Duration::from_secs(16));

                set_state(ConnectionState::Reconnecting { attempt }).await;
                attempt += 1;
                tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);

                // Stay command-responsive while backing off.
                let backoff = sleep(delay);
                tokio::pin!(backoff);
                loop {
                    tokio::select! {
                        _ = &mut backoff => break,
                        cmd = command_rx.recv() => {
                            match cmd {
                                Some(Command::Subscribe(sub)) => {
                                    queue_subscription(&mut pending, &active, sub);
                                }
                                Some(Command::Unsubscribe(unsub)) => {
                                    active.remove_matching(&unsub);
                                    pending.retain(|s| !(s.view == unsub.view && s.key == unsub.key));
                                }
                                Some(Command::ClearSubscriptions) => {
                                    active.clear();
                                    pending.clear();
                                }
                                Some(Command::Connect(ack)) => {
                                    // Resolves when the next attempt opens.
                                    if connect_ack.is_none() {
                                        connect_ack = Some(ack);
                                    } else {
                                        let _ = ack.send(Ok(()));
                                    }
                                }
                                Some(Command::Disconnect) => {
                                    set_state(ConnectionState::Disconnected).await;
                                    continue 'idle;
                                }
                                None => return,
                            }
                        }
                    }
                }
                continue 'session;
            }
        }
    });
}

fn queue_subscription(
    pending: &mut VecDeque<Subscription>,
    active: &SubscriptionSet,
    sub: Subscription,
) {
    if active.contains(&sub) {
        return;
    }
    if pending.iter().any(|s| s.sub_key() == sub.sub_key()) {
        return;
    }
    pending.push_back(sub);
}

async fn send_client_message(ws_tx: &mut WsSink, msg: &ClientMessage) {
    match serde_json::to_string(msg) {
        Ok(text) => {
            let _ = ws_tx.send(Message::Text(text)).await;
        }
        Err(e) => tracing::warn!("Failed to serialize client message: {}", e),
    }
}

fn dispatch_payload(
    frame_tx: &broadcast::Sender<Frame>,
    state_tx: &broadcast::Sender<ConnectionState>,
    decoded: Result<Frame, LiveStackError>,
) {
    match decoded {
        Ok(frame) => {
            let _ = frame_tx.send(frame);
        }
        Err(e) => {
            // One bad frame never tears the session down; observers see an
            // error transition on the state channel.
            tracing::warn!("Dropping undecodable frame: {}", e);
            let _ = state_tx.send(ConnectionState::Error);
        }
    }
}

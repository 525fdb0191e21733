use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use vesper_api::auth::AppState;
use vesper_types::events::{ConversationEvent, GatewayCommand};

/// Server sends a Ping every 15 seconds; two consecutive missed Pongs
/// (~30s) drop the connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Per-connection event buffer between topic forwarders and the socket.
const EVENT_BUFFER: usize = 64;

/// Handle one WebSocket connection: Identify handshake, then relay bus
/// events for subscribed conversations and accept typing signals. Presence
/// flips on connect and disconnect.
pub async fn handle_connection(socket: WebSocket, state: AppState, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);
    state.bus.connect(user_id);

    // Forwarders push bus events into one channel the send task drains.
    let (event_tx, mut event_rx) = mpsc::channel::<ConversationEvent>(EVENT_BUFFER);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_state = state.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        // conversation id -> forwarder task. Each task owns its bus
        // subscription; aborting it drops the subscription and releases
        // the topic.
        let mut forwarders: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(
                            &recv_state,
                            user_id,
                            &username_recv,
                            cmd,
                            &event_tx,
                            &mut forwarders,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            truncate_for_log(&text, 200)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        for handle in forwarders.into_values() {
            handle.abort();
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.bus.disconnect(user_id);
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    let timeout = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let claims = vesper_api::middleware::verify_token(jwt_secret, &token)?;
                    return Some((claims.sub, claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    state: &AppState,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
    event_tx: &mpsc::Sender<ConversationEvent>,
    forwarders: &mut HashMap<Uuid, JoinHandle<()>>,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::Subscribe { conversation_ids } => {
            let mut valid = Vec::new();
            for conversation_id in conversation_ids {
                if is_participant(state, conversation_id, user_id).await {
                    valid.push(conversation_id);
                } else {
                    warn!(
                        "{} ({}) tried to subscribe to conversation {} they are not in",
                        username, user_id, conversation_id
                    );
                }
            }
            info!(
                "{} ({}) subscribing to {} conversations",
                username,
                user_id,
                valid.len()
            );

            // Replace the current set: drop forwarders that fell out, add
            // the new ones.
            forwarders.retain(|conversation_id, handle| {
                if valid.contains(conversation_id) {
                    true
                } else {
                    handle.abort();
                    false
                }
            });
            for conversation_id in valid {
                if forwarders.contains_key(&conversation_id) {
                    continue;
                }
                let mut subscription = state.bus.subscribe(conversation_id);
                let tx = event_tx.clone();
                let handle = tokio::spawn(async move {
                    while let Some(event) = subscription.recv().await {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                });
                forwarders.insert(conversation_id, handle);
            }
        }

        GatewayCommand::StartTyping { conversation_id } => {
            // Only participants may signal typing; a stale or forged id is
            // dropped silently.
            if is_participant(state, conversation_id, user_id).await {
                state.bus.publish_typing(conversation_id, user_id);
            }
        }
    }
}

async fn is_participant(state: &AppState, conversation_id: Uuid, user_id: Uuid) -> bool {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let row = tokio::task::spawn_blocking(move || db.get_conversation(&cid)).await;
    match row {
        Ok(Ok(Some(row))) => {
            row.participant_a == user_id.to_string() || row.participant_b == user_id.to_string()
        }
        _ => false,
    }
}

/// Truncate client input for logging without splitting a multibyte
/// character.
fn truncate_for_log(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

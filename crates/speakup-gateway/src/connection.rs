use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use speakup_types::api::Claims;
use speakup_types::events::{GatewayCommand, GatewayEvent};
use speakup_types::optimistic::MutationOutcome;

use crate::Gateway;
use crate::calls::CallError;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Room codes this connection wants like events for.
type RoomSubscriptions = Arc<RwLock<HashSet<String>>>;

/// Handle a single WebSocket connection: Identify handshake, Ready, then the
/// event loop until either side goes away.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway) {
    let (mut sender, mut receiver) = socket.split();

    let Some((user_id, username)) = wait_for_identify(&mut receiver, &gateway.jwt_secret).await
    else {
        warn!("WebSocket client failed to identify, closing");
        return;
    };

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if !send_event(&mut sender, &ready).await {
        return;
    }

    run_connection_loop(sender, receiver, gateway, user_id, username).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    gateway: Gateway,
    user_id: Uuid,
    username: String,
) {
    // Subscribe before going online so our own Insert reaches us too
    let mut presence_rx = gateway.presence.subscribe_to_changes();
    let mut likes_rx = gateway.dispatcher.likes().subscribe();
    let mut notifications_rx = gateway.dispatcher.notifications().subscribe();
    let (conn_id, mut user_rx) = gateway.dispatcher.register_user_channel(user_id).await;

    if let Err(e) = gateway.presence.mark_online(user_id).await {
        warn!("{} ({}) could not be marked online: {}", username, user_id, e);
    }
    debug!("{} gateway connections open", gateway.dispatcher.connected_count().await);

    let rooms: RoomSubscriptions = Arc::new(RwLock::new(HashSet::new()));
    let send_rooms = rooms.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            let event = tokio::select! {
                result = presence_rx.recv() => match result {
                    Ok(change) => GatewayEvent::Presence(change),
                    Err(RecvError::Lagged(n)) => {
                        warn!("Presence receiver for {} lagged by {} events", user_id, n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                result = likes_rx.recv() => match result {
                    Ok(change) => {
                        let subscribed = send_rooms
                            .read()
                            .map(|rooms| rooms.contains(change.room_code()))
                            .unwrap_or(false);
                        if !subscribed {
                            continue;
                        }
                        GatewayEvent::Like(change)
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("Like receiver for {} lagged by {} events", user_id, n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                result = notifications_rx.recv() => match result {
                    Ok(change) if change.recipient() == user_id => GatewayEvent::Notification(change),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Notification receiver for {} lagged by {} events", user_id, n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                result = user_rx.recv() => match result {
                    Some(event) => event,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout for {} (missed {} pongs), dropping connection", user_id, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if !send_event(&mut sender, &event).await {
                break;
            }
        }
    });

    let recv_gateway = gateway.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        let reply =
                            handle_command(&recv_gateway, user_id, &username_recv, cmd, &rooms)
                                .await;
                        if let Some(reply) = reply {
                            recv_gateway.dispatcher.send_to_user(user_id, reply).await;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                    if let Err(e) = recv_gateway.presence.touch(user_id).await {
                        debug!("Heartbeat touch failed for {}: {}", user_id, e);
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // A newer connection for the same user keeps the session and presence
    if gateway
        .dispatcher
        .unregister_user_channel(user_id, conn_id)
        .await
    {
        gateway.calls.user_disconnected(user_id).await;
        if let Err(e) = gateway.presence.mark_offline(user_id).await {
            warn!("{} ({}) could not be marked offline: {}", username, user_id, e);
        }
    }
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &GatewayEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize gateway event: {}", e);
            true
        }
    }
}

/// Validate an HS256 session token. Shared with the REST auth layer.
pub fn verify_token(token: &str, jwt_secret: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    return verify_token(&token, jwt_secret)
                        .map(|claims| (claims.sub, claims.username));
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify)
        .await
        .ok()
        .flatten()
}

/// Run one client command. Call commands produce a `CommandResult` reply.
pub async fn handle_command(
    gateway: &Gateway,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
    rooms: &RoomSubscriptions,
) -> Option<GatewayEvent> {
    let command = cmd.name().to_string();
    let calls = &gateway.calls;

    let (call_id, result): (Option<Uuid>, Result<(), CallError>) = match cmd {
        GatewayCommand::Identify { .. } => return None, // Already handled

        GatewayCommand::Subscribe { room_codes } => {
            info!(
                "{} ({}) subscribing to {} rooms",
                username,
                user_id,
                room_codes.len()
            );
            let mut subs = rooms.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            *subs = room_codes.into_iter().collect();
            return None;
        }

        GatewayCommand::CallInvite {
            target_user_id,
            peer_id,
            room_code,
        } => match calls
            .initiate_call(user_id, username, target_user_id, peer_id, room_code)
            .await
        {
            Ok(call_id) => (Some(call_id), Ok(())),
            Err(e) => (None, Err(e)),
        },

        GatewayCommand::CallAccept { call_id, peer_id } => {
            (Some(call_id), calls.answer_call(user_id, call_id, peer_id).await)
        }

        GatewayCommand::CallReject { call_id } => {
            (Some(call_id), calls.reject_call(user_id, call_id).await)
        }

        GatewayCommand::CallConnected { call_id } => {
            (Some(call_id), calls.mark_connected(user_id, call_id).await)
        }

        GatewayCommand::CallEnd { call_id } => {
            (Some(call_id), calls.end_call(user_id, call_id).await)
        }

        GatewayCommand::CallSignalSend { call_id, signal } => {
            (Some(call_id), calls.relay_signal(user_id, call_id, signal).await)
        }

        GatewayCommand::CallMute { call_id, muted } => {
            (Some(call_id), calls.toggle_mute(user_id, call_id, muted).await)
        }
    };

    let outcome = match result {
        Ok(()) => MutationOutcome::Applied,
        Err(e) => {
            debug!("{} ({}) {} rejected: {}", username, user_id, command, e);
            MutationOutcome::rejected(e.to_string())
        }
    };

    Some(GatewayEvent::CommandResult {
        command,
        call_id,
        outcome,
    })
}

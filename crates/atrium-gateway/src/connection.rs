//! Per-connection lifecycle: Connecting -> Authenticated -> Joined(rooms)
//! -> Disconnected. Authentication happens before the upgrade completes;
//! this module owns everything after.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use atrium_types::events::{GatewayCommand, GatewayEvent};
use atrium_types::models::MessageKind;

use crate::Gateway;
use crate::verifier::VerifiedIdentity;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated WebSocket connection. The bearer token was
/// already verified at the HTTP upgrade layer, so the connection starts in
/// the Authenticated state.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, who: VerifiedIdentity) {
    let (sender, receiver) = socket.split();

    info!("{} ({}) connected to gateway", who.display_name, who.identity);

    let (conn_id, event_rx) = gateway.dispatcher.register().await;

    let pong_received = Arc::new(AtomicBool::new(true));

    let mut send_task = tokio::spawn(run_send_loop(
        sender,
        event_rx,
        pong_received.clone(),
    ));

    let gateway_recv = gateway.clone();
    let who_recv = who.clone();
    let mut recv_task = tokio::spawn(run_recv_loop(
        receiver,
        gateway_recv,
        conn_id,
        who_recv,
        pong_received,
    ));

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Teardown is idempotent: the dispatcher tolerates repeats and the
    // presence registry yields the entry exactly once, so the offline
    // broadcast cannot fire twice even if disconnect races itself.
    gateway.dispatcher.unregister(conn_id).await;
    if let Some(entry) = gateway.presence.unregister(conn_id).await {
        gateway
            .dispatcher
            .broadcast(
                GatewayEvent::PresenceChanged {
                    identity: entry.identity,
                    display_name: entry.display_name,
                    online: false,
                },
                None,
            )
            .await;
    }

    info!(
        "{} ({}) disconnected from gateway",
        who.display_name, who.identity
    );
}

/// Forward dispatcher events to the socket, interleaved with heartbeat
/// pings.
async fn run_send_loop(
    mut sender: SplitSink<WebSocket, WsMessage>,
    mut event_rx: mpsc::UnboundedReceiver<GatewayEvent>,
    pong_received: Arc<AtomicBool>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize gateway event: {}", e);
                        continue;
                    }
                };
                if sender.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sender.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Read client commands off the socket.
async fn run_recv_loop(
    mut receiver: SplitStream<WebSocket>,
    gateway: Gateway,
    conn_id: Uuid,
    who: VerifiedIdentity,
    pong_received: Arc<AtomicBool>,
) {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                Ok(cmd) => handle_command(&gateway, conn_id, &who, cmd).await,
                Err(e) => {
                    let preview: String = text.chars().take(200).collect();
                    warn!(
                        "{} ({}) bad command: {} -- raw: {}",
                        who.display_name, who.identity, e, preview
                    );
                }
            },
            WsMessage::Pong(_) => {
                pong_received.store(true, Ordering::Release);
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}

async fn handle_command(
    gateway: &Gateway,
    conn_id: Uuid,
    who: &VerifiedIdentity,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::AnnouncePresence { display_name } => {
            let display_name = display_name.unwrap_or_else(|| who.display_name.clone());
            info!("{} ({}) announcing presence", display_name, who.identity);

            // Replay who is already here to the new connection first, so
            // its roster is complete before anyone learns about it.
            for entry in gateway.presence.snapshot().await {
                if entry.identity.same_as(&who.identity) {
                    continue;
                }
                gateway
                    .dispatcher
                    .send_to(
                        conn_id,
                        GatewayEvent::PresenceChanged {
                            identity: entry.identity,
                            display_name: entry.display_name,
                            online: true,
                        },
                    )
                    .await;
            }

            gateway
                .presence
                .register(conn_id, who.identity.clone(), display_name.clone())
                .await;

            gateway
                .dispatcher
                .broadcast(
                    GatewayEvent::PresenceChanged {
                        identity: who.identity.clone(),
                        display_name,
                        online: true,
                    },
                    Some(conn_id),
                )
                .await;
        }

        GatewayCommand::JoinRoom { conversation_id } => {
            debug!("{} joining room {}", who.identity, conversation_id);
            gateway.dispatcher.join_room(conversation_id, conn_id).await;
        }

        GatewayCommand::LeaveRoom { conversation_id } => {
            debug!("{} leaving room {}", who.identity, conversation_id);
            gateway
                .dispatcher
                .leave_room(conversation_id, conn_id)
                .await;
        }

        GatewayCommand::SendMessage {
            conversation_id,
            body,
            kind,
            client_temp_id,
            reply_to,
        } => {
            handle_send_message(
                gateway,
                conn_id,
                who,
                conversation_id,
                body,
                kind,
                client_temp_id,
                reply_to,
            )
            .await;
        }

        GatewayCommand::TypingStart { conversation_id } => {
            gateway
                .dispatcher
                .publish(
                    conversation_id,
                    GatewayEvent::TypingChanged {
                        conversation_id,
                        identity: who.identity.clone(),
                        display_name: who.display_name.clone(),
                        is_typing: true,
                    },
                    Some(conn_id),
                )
                .await;
        }

        GatewayCommand::TypingStop { conversation_id } => {
            gateway
                .dispatcher
                .publish(
                    conversation_id,
                    GatewayEvent::TypingChanged {
                        conversation_id,
                        identity: who.identity.clone(),
                        display_name: who.display_name.clone(),
                        is_typing: false,
                    },
                    Some(conn_id),
                )
                .await;
        }

        GatewayCommand::MarkRead { conversation_id } => {
            let db = gateway.db.clone();
            let reader = who.identity.clone();
            let result =
                tokio::task::spawn_blocking(move || db.mark_all_read(conversation_id, &reader))
                    .await;

            match result {
                Ok(Ok(read_count)) => {
                    debug!(
                        "{} marked {} messages read in {}",
                        who.identity, read_count, conversation_id
                    );
                    gateway
                        .dispatcher
                        .publish(
                            conversation_id,
                            GatewayEvent::ReadReceiptUpdated {
                                conversation_id,
                                identity: who.identity.clone(),
                                read_count,
                            },
                            Some(conn_id),
                        )
                        .await;
                }
                Ok(Err(e)) => {
                    warn!("{} mark-read failed in {}: {}", who.identity, conversation_id, e);
                }
                Err(e) => {
                    warn!("mark-read join error: {}", e);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_send_message(
    gateway: &Gateway,
    conn_id: Uuid,
    who: &VerifiedIdentity,
    conversation_id: Uuid,
    body: String,
    kind: MessageKind,
    client_temp_id: String,
    reply_to: Option<Uuid>,
) {
    if body.trim().is_empty() {
        gateway
            .dispatcher
            .send_to(
                conn_id,
                GatewayEvent::SendFailed {
                    client_temp_id,
                    message: "Message body is required".into(),
                },
            )
            .await;
        return;
    }

    // Serialize append + room publish per conversation so every joined
    // connection observes messages in store insertion order.
    let order_lock = gateway.dispatcher.order_lock(conversation_id).await;
    let message = {
        let _guard = order_lock.lock().await;

        let db = gateway.db.clone();
        let sender = who.identity.clone();
        let sender_name = who.display_name.clone();
        let result = tokio::task::spawn_blocking(move || {
            db.append_message(conversation_id, &sender, &sender_name, &body, kind, reply_to)
        })
        .await;

        let message = match result {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                gateway
                    .dispatcher
                    .send_to(
                        conn_id,
                        GatewayEvent::SendFailed {
                            client_temp_id,
                            message: e.to_string(),
                        },
                    )
                    .await;
                return;
            }
            Err(e) => {
                warn!("send-message join error: {}", e);
                gateway
                    .dispatcher
                    .send_to(
                        conn_id,
                        GatewayEvent::SendFailed {
                            client_temp_id,
                            message: "Internal error".into(),
                        },
                    )
                    .await;
                return;
            }
        };

        // Everyone joined to the room gets the canonical message, the
        // sender's own connection included so it can reconcile.
        gateway
            .dispatcher
            .publish(
                conversation_id,
                GatewayEvent::MessageAppended {
                    message: message.clone(),
                },
                None,
            )
            .await;
        message
    };

    gateway
        .dispatcher
        .send_to(
            conn_id,
            GatewayEvent::SendAcknowledged {
                client_temp_id,
                message_id: message.id,
                seq: message.seq,
                timestamp: message.created_at,
            },
        )
        .await;

    // Participants outside the room: online ones get a targeted copy for
    // their notification UI, offline ones surface through the aggregator
    // on their next poll.
    let db = gateway.db.clone();
    let conversation = tokio::task::spawn_blocking(move || db.get_conversation(conversation_id)).await;
    let conversation = match conversation {
        Ok(Ok(conv)) => conv,
        Ok(Err(e)) => {
            warn!("participant lookup failed for {}: {}", conversation_id, e);
            return;
        }
        Err(e) => {
            warn!("participant lookup join error: {}", e);
            return;
        }
    };

    for participant in &conversation.participants {
        if participant.identity.same_as(&who.identity) {
            continue;
        }
        let conns = gateway.presence.conns_for(&participant.identity).await;
        if conns.is_empty() {
            debug!(
                "{} is offline; message {} left for notification poll",
                participant.identity, message.id
            );
            continue;
        }
        for recipient in conns {
            if gateway.dispatcher.is_joined(conversation_id, recipient).await {
                continue;
            }
            gateway
                .dispatcher
                .send_to(
                    recipient,
                    GatewayEvent::MessageAppended {
                        message: message.clone(),
                    },
                )
                .await;
        }
    }
}

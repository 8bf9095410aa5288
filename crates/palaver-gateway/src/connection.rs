use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use palaver_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Serve one gateway connection until either side goes away.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher) {
    let (sender, mut receiver) = socket.split();

    let conn_id = dispatcher.register_connection().await;
    info!("Gateway connection {} opened", conn_id);

    // Replies to this connection only (subscription acks)
    let (direct_tx, direct_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(run_send_loop(
        sender,
        dispatcher.clone(),
        conn_id,
        direct_rx,
        pong_received,
    ));

    let dispatcher_recv = dispatcher.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher_recv, conn_id, cmd, &direct_tx).await;
                    }
                    Err(e) => {
                        warn!(
                            "Connection {} bad command: {} -- raw: {}",
                            conn_id,
                            e,
                            text.chars().take(200).collect::<String>()
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
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister_connection(conn_id).await;
    info!("Gateway connection {} closed", conn_id);
}

/// Forward subscribed notices and direct replies to the client, with heartbeat.
async fn run_send_loop(
    mut sender: SplitSink<WebSocket, Message>,
    dispatcher: Dispatcher,
    conn_id: Uuid,
    mut direct_rx: mpsc::UnboundedReceiver<GatewayEvent>,
    pong_received: Arc<AtomicBool>,
) {
    let mut broadcast_rx = dispatcher.subscribe();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            result = broadcast_rx.recv() => {
                let notice = match result {
                    Ok(notice) => notice,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Dropped appends are a tolerated gap; clients recover by paginating.
                        warn!("Connection {} lagged by {} notices", conn_id, n);
                        continue;
                    }
                    Err(_) => break,
                };

                if !dispatcher.is_subscribed(conn_id, &notice.channel_id).await {
                    continue;
                }

                if sender.send(Message::Text(notice.json.to_string().into())).await.is_err() {
                    break;
                }
            }
            event = direct_rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize gateway event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection {}", missed_heartbeats, conn_id);
                        break;
                    }
                }
                if sender.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn handle_command(
    dispatcher: &Dispatcher,
    conn_id: Uuid,
    cmd: GatewayCommand,
    direct_tx: &mpsc::UnboundedSender<GatewayEvent>,
) {
    match cmd {
        GatewayCommand::Subscribe { channel_id } => {
            // Every notice published after this point reaches the client in
            // order. Clients read the log forward once `Subscribed` arrives to
            // pick up anything older.
            if !dispatcher.add_subscription(conn_id, &channel_id).await {
                debug!("Connection {} already subscribed to {}", conn_id, channel_id);
            }
            let _ = direct_tx.send(GatewayEvent::Subscribed { channel_id });
        }

        GatewayCommand::Unsubscribe { channel_id } => {
            dispatcher.remove_subscription(conn_id, &channel_id).await;
            let _ = direct_tx.send(GatewayEvent::Unsubscribed { channel_id });
        }
    }
}

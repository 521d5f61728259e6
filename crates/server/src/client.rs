//! Per-connection admission and receive loop (§4.5 admission sequence,
//! §4.6 server responsibilities).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use syncboard_protocol::{awareness, codec, Frame, SyncProtocol};
use syncboard_room::Room;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Drive one client's WebSocket for as long as the connection lives.
/// Returns only once the socket closes, the peer goes quiet, or the client
/// is evicted as a slow consumer — every exit path is a clean `Room::leave`,
/// never a panic or an unhandled error bubbling out of the task.
pub async fn handle_connection(socket: WebSocket, room_path: String, room: Arc<Room>) {
    let client_id = room.allocate_client_id();
    let (mut broadcast_rx, initial_sync_step1, awareness_snapshot) = room.join(client_id).await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    if ws_tx.send(Message::Binary(initial_sync_step1.into())).await.is_err() {
        room.leave(client_id);
        return;
    }
    if !awareness_snapshot.is_empty() {
        let payload = codec::encode_awareness(&awareness::encode_update(&awareness_snapshot));
        let _ = ws_tx.send(Message::Binary(payload.into())).await;
    }

    info!(room = %room_path, client_id, "client admitted");
    let mut sync = SyncProtocol::new();

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                let Some(incoming) = incoming else { break };
                match incoming {
                    Ok(Message::Binary(bytes)) => {
                        let frame = match codec::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!(room = %room_path, client_id, error = %e, "dropping malformed frame");
                                continue;
                            }
                        };
                        match room.ingest(client_id, frame, &mut sync).await {
                            Ok(outcome) => {
                                for frame in outcome.outbound {
                                    if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(room = %room_path, client_id, error = %e, "crdt rejected update, dropping frame");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
            broadcast = broadcast_rx.recv() => {
                match broadcast {
                    Ok((origin, frame)) => {
                        if origin == client_id {
                            continue; // at-most-once self-echo (§4.5, §8)
                        }
                        if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(room = %room_path, client_id, skipped, "slow consumer, disconnecting");
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    room.leave(client_id);
    info!(room = %room_path, client_id, "client disconnected");
}

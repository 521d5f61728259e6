//! The client-side provider (§4.7): binds one CRDT document to one
//! WebSocket connection, mirroring local edits to the wire and applying
//! remote ones back into the document.
//!
//! A provider does not reconnect itself — if the transport drops, its
//! `synced` watch clears and the caller is expected to construct a fresh
//! provider over a new connection. Reconnection policy (backoff, retry
//! limits) is deliberately left out of this crate.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use syncboard_protocol::{codec, Frame, SyncOutcome, SyncProtocol, YDoc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("invalid broker url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Binds one [`YDoc`] to one connection. Dropping a `Provider` (or calling
/// [`Provider::close`]) cancels its receive loop and unsubscribes from the
/// document; no partially-applied update is rolled back, since CRDT
/// updates are idempotent and safe to re-receive after reconnection.
pub struct Provider {
    doc: Arc<YDoc>,
    synced_rx: watch::Receiver<bool>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl Provider {
    /// Connect to `url` and begin the sync handshake immediately. Returns
    /// once the transport is established and the local subscription and
    /// receive loop are running; convergence with the server happens
    /// asynchronously and is observed through [`Provider::synced`].
    pub async fn connect(url: &str, doc: Arc<YDoc>) -> Result<Self, ProviderError> {
        let url = url::Url::parse(url)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (synced_tx, synced_rx) = watch::channel(false);

        // Mirror every locally-committed update to the wire (§4.7 step 1).
        let sub_tx = outbound_tx.clone();
        let sub_doc = doc.clone();
        let subscription = doc.subscribe(move |update| {
            if let Some(frame) = SyncProtocol::encode_local_update(&sub_doc, update) {
                let _ = sub_tx.send(frame);
            }
        });

        let initial = SyncProtocol::initial_sync_step1(&doc);
        let _ = outbound_tx.send(initial);

        let task_doc = doc.clone();
        let task = tokio::spawn(async move {
            let mut sync = SyncProtocol::new();
            loop {
                tokio::select! {
                    outgoing = outbound_rx.recv() => {
                        let Some(bytes) = outgoing else { break };
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    incoming = ws_rx.next() => {
                        let Some(incoming) = incoming else { break };
                        match incoming {
                            Ok(Message::Binary(bytes)) => {
                                let frame = match codec::decode(&bytes) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        debug!(error = %e, "dropping malformed frame");
                                        continue;
                                    }
                                };
                                match handle_frame(&task_doc, frame, &mut sync) {
                                    Ok(outcome) => {
                                        if outcome.synced_edge {
                                            let _ = synced_tx.send(true);
                                        }
                                        for reply in outcome.outbound {
                                            if ws_tx.send(Message::Binary(reply)).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                    Err(e) => warn!(error = %e, "crdt rejected inbound frame"),
                                }
                            }
                            Ok(Message::Close(_)) => break,
                            Ok(_) => continue,
                            Err(_) => break,
                        }
                    }
                }
            }
            task_doc.unsubscribe(subscription);
            let _ = synced_tx.send(false);
        });

        Ok(Self { doc, synced_rx, outbound_tx, task })
    }

    /// True once this connection has completed at least one sync handshake
    /// round trip. Clears the moment the transport drops.
    pub fn is_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    /// A watch handle callers can `.changed().await` on to observe sync
    /// state transitions, including the clear-on-disconnect edge.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced_rx.clone()
    }

    pub fn document(&self) -> &Arc<YDoc> {
        &self.doc
    }

    /// Send a locally-produced awareness update over the wire.
    pub fn send_awareness(&self, payload: &[u8]) {
        let _ = self.outbound_tx.send(codec::encode_awareness(payload));
    }

    /// Cancel the receive loop and unsubscribe from the document.
    pub async fn close(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

fn handle_frame(doc: &YDoc, frame: Frame, sync: &mut SyncProtocol) -> Result<SyncOutcome, syncboard_common::Error> {
    sync.handle(frame, doc)
}

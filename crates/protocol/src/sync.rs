//! The symmetric sync-step1/sync-step2/update state machine (§4.2).
//!
//! Both ends of a connection run the same state machine and both send their
//! own `SyncStep1` as soon as the connection is ready, rather than one side
//! waiting to be asked — that is what lets a fresh connection converge in a
//! single round trip instead of two.

use crate::codec::{self, Frame};
use crate::document::YDoc;
use syncboard_common::Error;

/// Per-connection sync state. `synced` is edge-triggered: it becomes true
/// exactly once, the first time this end receives a `SyncStep2` reply to
/// its own `SyncStep1`, and never fires again even if the peer resends one.
#[derive(Default)]
pub struct SyncProtocol {
    synced: bool,
}

/// The result of feeding one inbound frame through [`SyncProtocol::handle`].
#[derive(Default)]
pub struct SyncOutcome {
    /// Wire-ready frames to send back to the peer, in order.
    pub outbound: Vec<Vec<u8>>,
    /// True exactly on the call that transitions this connection from
    /// unsynced to synced.
    pub synced_edge: bool,
}

impl SyncProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// The frame to send the moment a connection is accepted: our own
    /// state vector, inviting the peer to diff against it.
    pub fn initial_sync_step1(doc: &YDoc) -> Vec<u8> {
        codec::encode_sync_step1(&doc.state_vector())
    }

    /// Advance the state machine with one decoded frame, applying it to
    /// `doc` where relevant and returning what (if anything) to send back.
    pub fn handle(&mut self, frame: Frame, doc: &YDoc) -> Result<SyncOutcome, Error> {
        match frame {
            Frame::SyncStep1(remote_sv) => {
                let diff = doc.encode_diff(&remote_sv)?;
                Ok(SyncOutcome {
                    outbound: vec![codec::encode_sync_step2(&diff)],
                    synced_edge: false,
                })
            }
            Frame::SyncStep2(update) => {
                if !update.is_empty() {
                    doc.apply_update(&update)?;
                }
                let synced_edge = !self.synced;
                self.synced = true;
                Ok(SyncOutcome { outbound: Vec::new(), synced_edge })
            }
            Frame::Update(update) => {
                doc.apply_update(&update)?;
                Ok(SyncOutcome::default())
            }
            // Awareness frames are handled by the awareness registry, not
            // the sync state machine; unknown tags are ignored per the
            // tolerant-peer policy.
            Frame::Awareness(_) | Frame::Unknown(_) => Ok(SyncOutcome::default()),
        }
    }

    /// Build an outbound frame for a locally-produced update, or `None` if
    /// the update is empty and shouldn't be sent at all (§9).
    pub fn encode_local_update(doc: &YDoc, update: &[u8]) -> Option<Vec<u8>> {
        if doc.is_advancing(update) {
            Some(codec::encode_update(update))
        } else {
            None
        }
    }
}

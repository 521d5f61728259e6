//! Wire codec, sync state machine, document handle, and awareness registry
//! for the CRDT sync broker.
//!
//! This crate has no notion of rooms, transports, or persistence — see
//! `syncboard-room` and `syncboard-store` for those. It only knows how to
//! turn bytes into frames, drive the sync handshake, hold one CRDT replica,
//! and track who's present in a document.

pub mod awareness;
pub mod codec;
pub mod document;
pub mod sync;

pub use awareness::{AwarenessEntry, AwarenessRegistry};
pub use codec::Frame;
pub use document::{SubscriptionHandle, YDoc};
pub use sync::{SyncOutcome, SyncProtocol};

//! Pluggable append-only persistence for CRDT updates (§4.4).
//!
//! A store only ever sees raw update bytes; it has no idea what a CRDT is.
//! Callers (the room) are responsible for deciding when to squash and for
//! reconstructing document state by applying every loaded update in order
//! to a fresh replica.

mod db;
mod file;
mod format;

pub use db::SqliteYStore;
pub use file::{FileYStore, TempFileYStore};

use async_trait::async_trait;
use syncboard_common::{Result, Timestamp};

/// A persisted, append-only log of updates for one document.
#[async_trait]
pub trait UpdateStore: Send + Sync {
    /// Append one update with caller-attached metadata (e.g. an author id),
    /// stamped with the current time. Returns `Error::StoreClosed` if the
    /// store has been closed or has degraded into a read-only state after
    /// detecting corruption.
    async fn append(&self, update: &[u8], metadata: &[u8]) -> Result<()>;

    /// Load every update recorded so far, oldest first, along with its
    /// metadata and the timestamp it was appended at.
    async fn load(&self) -> Result<Vec<(Vec<u8>, Vec<u8>, Timestamp)>>;

    /// Atomically replace the entire log with a single update representing
    /// the same CRDT state. Used to bound replay cost once a document has
    /// accumulated many small updates.
    async fn squash(&self, squashed: &[u8]) -> Result<()>;

    /// Release any resources held by this store. Further calls return
    /// `Error::StoreClosed`.
    async fn close(&self) -> Result<()>;
}

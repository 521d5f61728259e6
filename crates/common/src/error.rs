//! Error types shared across the sync broker.

use thiserror::Error;

/// Errors the broker can surface.
///
/// Per the propagation policy, most of these are confined to a single client
/// or a single store and never tear down a room.
#[derive(Error, Debug)]
pub enum Error {
    /// A wire frame could not be decoded. The caller drops the frame and
    /// keeps the connection open.
    #[error("malformed frame: {0}")]
    Decode(String),

    /// A client's outbound queue overflowed; that client is disconnected.
    #[error("slow consumer")]
    SlowConsumer,

    /// The persisted store version does not match what this build supports.
    #[error("store version mismatch: expected {expected}, found {found}")]
    StoreVersionMismatch { expected: u64, found: u64 },

    /// An operation was attempted on a store whose lifecycle has ended.
    #[error("store closed")]
    StoreClosed,

    /// The transport failed on send or receive.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// The CRDT library rejected an update (corrupted or incompatible bytes).
    #[error("crdt rejected update: {0}")]
    CrdtRejected(String),

    /// I/O failure underlying a store backend.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

//! Thin wrapper around the CRDT replica.
//!
//! Per the design notes, the broker core only ever invokes four capabilities
//! on a document: `state_vector`, `encode_diff`, `apply_update`, and
//! `subscribe`/`unsubscribe`. Everything else about the underlying CRDT
//! library (currently `yrs`) is kept out of the rest of the crate so a
//! different CRDT implementation exposing the same four calls could be
//! dropped in without touching the protocol, room, or store code.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use syncboard_common::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// An opaque token returned by [`YDoc::subscribe`]; pass it to
/// [`YDoc::unsubscribe`] to remove that callback. A document supports one
/// live subscriber at a time, which is all the broker (room ingest, or a
/// client provider) ever needs.
pub struct SubscriptionHandle(());

/// A CRDT document replica.
///
/// Two replicas that have applied the same *set* of update bytes are
/// semantically equal regardless of the order updates arrived in.
pub struct YDoc {
    doc: Doc,
    subscription: Mutex<Option<Box<dyn Any + Send>>>,
    /// Set for the duration of [`YDoc::apply_update`]'s commit so the
    /// subscriber registered via [`YDoc::subscribe`] can tell a remote
    /// apply from a genuine local edit and skip forwarding it — without
    /// this, a provider would echo every inbound update straight back to
    /// the peer it came from, which that peer then re-broadcasts to the
    /// rest of the room forever.
    applying_remote: Arc<AtomicBool>,
}

impl YDoc {
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            subscription: Mutex::new(None),
            applying_remote: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A compact summary of which updates this replica has observed.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// The minimal update bringing a peer (described by `remote_sv`) up to
    /// this replica's state.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, Error> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| Error::Decode(format!("bad state vector: {e}")))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Merge an update into this replica. Idempotent and commutative with
    /// respect to other applies. Any registered subscriber is invoked
    /// synchronously, inline with this call, once the transaction commits,
    /// but — unlike a genuine local edit — that invocation is suppressed:
    /// this method is only ever called with bytes that arrived from a
    /// remote peer (sync-step or update frame, or store replay), so
    /// forwarding it back out would just echo it to whoever sent it.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), Error> {
        let update = Update::decode_v1(update)
            .map_err(|e| Error::CrdtRejected(format!("undecodable update: {e}")))?;
        self.applying_remote.store(true, Ordering::SeqCst);
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update);
        } // txn commits (and fires the observer) on drop, while the flag is still set
        self.applying_remote.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Register a callback invoked with the raw update bytes after every
    /// *local* commit — a transaction made directly against the document,
    /// not one produced by [`YDoc::apply_update`]. Replaces any previous
    /// subscription on this document.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let applying_remote = self.applying_remote.clone();
        let sub = self
            .doc
            .observe_update_v1(move |_txn, event| {
                if applying_remote.load(Ordering::SeqCst) {
                    return;
                }
                callback(&event.update)
            })
            .expect("document was dropped while subscribing");
        *self.subscription.lock().unwrap() = Some(Box::new(sub));
        SubscriptionHandle(())
    }

    /// Remove the current subscription, if any.
    pub fn unsubscribe(&self, _handle: SubscriptionHandle) {
        self.subscription.lock().unwrap().take();
    }

    /// The underlying CRDT document, for callers that need to read or
    /// mutate shared types (text, maps, arrays) directly. The
    /// four-capability contract above covers synchronization only; making
    /// genuine local edits is inherently specific to the CRDT library in
    /// use, so this is the one place that library leaks through.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// True if `update` carries any blocks or deletions at all. Used to
    /// filter semantically-empty updates before they are broadcast or
    /// written to the store (§4.2, §9) — an update with nothing in it would
    /// otherwise still cost a fan-out and an append.
    pub fn is_advancing(&self, update: &[u8]) -> bool {
        match Update::decode_v1(update) {
            Ok(update) => !update.is_empty(),
            Err(_) => false,
        }
    }
}

impl Default for YDoc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text};

    #[test]
    fn two_replicas_converge_regardless_of_apply_order() {
        let src = Doc::new();
        let text = src.get_or_insert_text("content");
        {
            let mut txn = src.transact_mut();
            text.insert(&mut txn, 0, "hello");
        }
        let update = src.transact().encode_state_as_update_v1(&StateVector::default());

        let a = YDoc::new();
        a.apply_update(&update).unwrap();

        let text = a.doc.get_or_insert_text("content");
        let txn = a.doc.transact();
        assert_eq!(text.get_string(&txn), "hello");
    }

    #[test]
    fn apply_update_is_idempotent() {
        let src = Doc::new();
        let text = src.get_or_insert_text("content");
        {
            let mut txn = src.transact_mut();
            text.insert(&mut txn, 0, "abc");
        }
        let update = src.transact().encode_state_as_update_v1(&StateVector::default());

        let dst = YDoc::new();
        dst.apply_update(&update).unwrap();
        dst.apply_update(&update).unwrap();

        let text = dst.doc.get_or_insert_text("content");
        let txn = dst.doc.transact();
        assert_eq!(text.get_string(&txn), "abc");
    }

    #[test]
    fn subscribe_receives_local_transaction_updates() {
        let doc = YDoc::new();
        let received = std::sync::Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let handle = doc.subscribe(move |bytes| received_clone.lock().unwrap().push(bytes.to_vec()));

        {
            let text = doc.doc.get_or_insert_text("content");
            let mut txn = doc.doc.transact_mut();
            text.insert(&mut txn, 0, "x");
        }

        assert_eq!(received.lock().unwrap().len(), 1);
        doc.unsubscribe(handle);

        {
            let text = doc.doc.get_or_insert_text("content");
            let mut txn = doc.doc.transact_mut();
            text.insert(&mut txn, 0, "y");
        }
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn subscribe_does_not_fire_for_remote_applies() {
        let doc = YDoc::new();
        let received = std::sync::Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let _handle = doc.subscribe(move |bytes| received_clone.lock().unwrap().push(bytes.to_vec()));

        let src = Doc::new();
        let text = src.get_or_insert_text("content");
        {
            let mut txn = src.transact_mut();
            text.insert(&mut txn, 0, "from-peer");
        }
        let update = src.transact().encode_state_as_update_v1(&StateVector::default());

        doc.apply_update(&update).unwrap();
        assert!(received.lock().unwrap().is_empty());

        // A genuine local edit on the same document still forwards normally.
        {
            let text = doc.doc.get_or_insert_text("local");
            let mut txn = doc.doc.transact_mut();
            text.insert(&mut txn, 0, "hi");
        }
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn encode_diff_round_trips_through_state_vector() {
        let a = YDoc::new();
        {
            let text = a.doc.get_or_insert_text("content");
            let mut txn = a.doc.transact_mut();
            text.insert(&mut txn, 0, "sync-me");
        }

        let b = YDoc::new();
        let sv = b.state_vector();
        let diff = a.encode_diff(&sv).unwrap();
        b.apply_update(&diff).unwrap();

        let text = b.doc.get_or_insert_text("content");
        let txn = b.doc.transact();
        assert_eq!(text.get_string(&txn), "sync-me");
    }

    #[test]
    fn empty_update_is_not_advancing() {
        let doc = YDoc::new();
        let empty = doc.state_vector();
        let diff = doc.encode_diff(&empty).unwrap();
        assert!(!doc.is_advancing(&diff));
    }
}

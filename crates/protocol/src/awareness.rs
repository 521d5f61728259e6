//! Ephemeral presence registry (§4.3).
//!
//! Awareness state (cursors, selections, online status) is never persisted
//! and never goes through the CRDT — it's a clock-based last-write-wins map
//! keyed by client id, wire-compatible with the `y-protocols` awareness
//! format so off-the-shelf Yjs clients can read and write it directly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use syncboard_common::Error;

use crate::codec::{write_buf, write_var_u64, Reader};

/// One client's awareness state as held in the registry.
#[derive(Debug, Clone)]
struct Entry {
    clock: u64,
    /// `None` means the client has announced its own departure (explicit
    /// null state), distinct from simply timing out.
    state: Option<Value>,
    last_seen: Instant,
}

/// One `(client_id, clock, state)` triple decoded off the wire. `state` of
/// `None` serializes as the JSON literal `null`, which in the wire protocol
/// means "this client is gone."
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<Value>,
}

/// The clock-based LWW registry of all clients present in a room.
pub struct AwarenessRegistry {
    entries: HashMap<u64, Entry>,
    ttl: Duration,
}

impl AwarenessRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: HashMap::new(), ttl }
    }

    /// Apply a decoded update. Per client id, an incoming entry only takes
    /// effect if its clock is strictly greater than the clock already on
    /// file — clocks are strictly monotonic per client id, so an equal
    /// clock is a stale resend, not a newer write, and is discarded like
    /// anything older. Returns the entries that were actually applied
    /// (i.e. survived the LWW check), which is what a caller should
    /// re-broadcast; an empty result means nothing changed.
    pub fn apply(&mut self, entries: &[AwarenessEntry]) -> Vec<AwarenessEntry> {
        let now = Instant::now();
        let mut applied = Vec::new();
        for entry in entries {
            let accept = match self.entries.get(&entry.client_id) {
                Some(existing) => entry.clock > existing.clock,
                None => true,
            };
            if !accept {
                continue;
            }
            self.entries.insert(
                entry.client_id,
                Entry { clock: entry.clock, state: entry.state.clone(), last_seen: now },
            );
            applied.push(entry.clone());
        }
        applied
    }

    /// Drop clients that haven't been heard from within the TTL. Returns a
    /// synthetic departure entry (state `None`, clock bumped by one) for
    /// each expired client, ready to broadcast so peers clear them too.
    pub fn expire(&mut self) -> Vec<AwarenessEntry> {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) > self.ttl && e.state.is_some())
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .map(|id| {
                let clock = self.entries.get(&id).map(|e| e.clock + 1).unwrap_or(1);
                self.entries.remove(&id);
                AwarenessEntry { client_id: id, clock, state: None }
            })
            .collect()
    }

    /// Force a single client's entry to departed state, regardless of TTL.
    /// Used when a connection closes cleanly rather than timing out — the
    /// room still owes everyone else a departure broadcast. Returns `None`
    /// if the client had no entry (it never set awareness state at all).
    pub fn force_depart(&mut self, client_id: u64) -> Option<AwarenessEntry> {
        let clock = self.entries.get(&client_id).map(|e| e.clock + 1)?;
        self.entries.remove(&client_id);
        Some(AwarenessEntry { client_id, clock, state: None })
    }

    /// The full registry contents, one entry per present client, suitable
    /// to replay to a newly-joined client so it learns about everyone
    /// already in the room.
    pub fn snapshot(&self) -> Vec<AwarenessEntry> {
        self.entries
            .iter()
            .map(|(id, e)| AwarenessEntry { client_id: *id, clock: e.clock, state: e.state.clone() })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Encode entries as an awareness update payload (the bytes carried inside
/// a `Frame::Awareness`): `varint(count) | repeated { varint(client_id)
/// varint(clock) varint(len)|json_bytes }`.
pub fn encode_update(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    write_var_u64(&mut out, entries.len() as u64);
    for entry in entries {
        write_var_u64(&mut out, entry.client_id);
        write_var_u64(&mut out, entry.clock);
        let json = serde_json::to_vec(&entry.state.clone().unwrap_or(Value::Null))
            .unwrap_or_else(|_| b"null".to_vec());
        write_buf(&mut out, &json);
    }
    out
}

/// Decode an awareness update payload.
pub fn decode_update(bytes: &[u8]) -> Result<Vec<AwarenessEntry>, Error> {
    let mut r = Reader::new(bytes);
    let count = r.read_var_u64()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let client_id = r.read_var_u64()?;
        let clock = r.read_var_u64()?;
        let json = r.read_buf()?;
        let value: Value = serde_json::from_slice(json)
            .map_err(|e| Error::Decode(format!("bad awareness state json: {e}")))?;
        let state = if value.is_null() { None } else { Some(value) };
        entries.push(AwarenessEntry { client_id, clock, state });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, clock: u64, online: bool) -> AwarenessEntry {
        AwarenessEntry {
            client_id: id,
            clock,
            state: if online { Some(serde_json::json!({"user": "alice"})) } else { None },
        }
    }

    #[test]
    fn wire_format_round_trips() {
        let entries = vec![entry(1, 10, true), entry(2, 1, false)];
        let bytes = encode_update(&entries);
        let decoded = decode_update(&bytes).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn newer_clock_overwrites_older_state() {
        let mut reg = AwarenessRegistry::new(Duration::from_secs(30));
        reg.apply(&[entry(1, 1, true)]);
        let applied = reg.apply(&[entry(1, 2, false)]);
        assert_eq!(applied.len(), 1);
        assert_eq!(reg.snapshot()[0].state, None);
    }

    #[test]
    fn stale_clock_is_rejected() {
        let mut reg = AwarenessRegistry::new(Duration::from_secs(30));
        reg.apply(&[entry(1, 5, true)]);
        let applied = reg.apply(&[entry(1, 3, false)]);
        assert!(applied.is_empty());
        assert_eq!(reg.snapshot()[0].clock, 5);
    }

    #[test]
    fn equal_clock_is_rejected_not_overwritten() {
        let mut reg = AwarenessRegistry::new(Duration::from_secs(30));
        reg.apply(&[entry(1, 4, true)]);
        let applied = reg.apply(&[entry(1, 4, false)]);
        assert!(applied.is_empty());
        assert_eq!(reg.snapshot()[0].clock, 4);
        assert_eq!(reg.snapshot()[0].state, Some(serde_json::json!({"user": "alice"})));
    }

    #[test]
    fn null_state_means_departure() {
        let mut reg = AwarenessRegistry::new(Duration::from_secs(30));
        reg.apply(&[entry(1, 1, true)]);
        reg.apply(&[entry(1, 2, false)]);
        assert_eq!(reg.snapshot()[0].state, None);
    }

    #[test]
    fn ttl_expiry_drops_stale_clients() {
        let mut reg = AwarenessRegistry::new(Duration::from_millis(0));
        reg.apply(&[entry(1, 1, true)]);
        std::thread::sleep(Duration::from_millis(5));
        let expired = reg.expire();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].client_id, 1);
        assert_eq!(expired[0].state, None);
        assert!(reg.is_empty());
    }

    #[test]
    fn force_depart_removes_entry_and_bumps_clock() {
        let mut reg = AwarenessRegistry::new(Duration::from_secs(30));
        reg.apply(&[entry(1, 4, true)]);
        let departed = reg.force_depart(1).unwrap();
        assert_eq!(departed.client_id, 1);
        assert_eq!(departed.clock, 5);
        assert_eq!(departed.state, None);
        assert!(reg.is_empty());
    }

    #[test]
    fn force_depart_on_unknown_client_is_none() {
        let mut reg = AwarenessRegistry::new(Duration::from_secs(30));
        assert!(reg.force_depart(42).is_none());
    }

    #[test]
    fn expiry_does_not_reexpire_already_departed_clients() {
        let mut reg = AwarenessRegistry::new(Duration::from_millis(0));
        reg.apply(&[entry(1, 1, false)]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(reg.expire().is_empty());
    }
}

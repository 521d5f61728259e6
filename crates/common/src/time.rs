//! Monotonic wall-clock timestamps for store records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, guaranteed non-decreasing across calls to
/// [`Timestamp::now`] within one process even if the system clock stalls or
/// steps backward.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct Timestamp(pub f64);

static LAST_MICROS: AtomicU64 = AtomicU64::new(0);

impl Timestamp {
    pub fn now() -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;

        let micros = LAST_MICROS
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(wall.max(last + 1))
            })
            .unwrap_or(wall);

        Timestamp(micros as f64 / 1_000_000.0)
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Timestamp(f64::from_le_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_strictly_increasing_under_rapid_calls() {
        let mut last = Timestamp::now();
        for _ in 0..1000 {
            let next = Timestamp::now();
            assert!(next.0 >= last.0);
            last = next;
        }
    }
}

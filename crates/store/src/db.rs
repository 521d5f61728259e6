//! A `sqlx`-backed [`UpdateStore`], for deployments that would rather keep
//! updates in the same database as everything else instead of a bare file.
//!
//! Queries are written against the query builder rather than the `sqlx::query!`
//! macros, since the macros need a live database reachable at compile time.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use syncboard_common::{Error, Result, Timestamp};

use crate::format::FORMAT_VERSION;
use crate::UpdateStore;

/// One document's worth of updates, identified by `room`, stored in a
/// shared `SqlitePool` alongside whatever else the deployment keeps there.
pub struct SqliteYStore {
    pool: SqlitePool,
    room: String,
    closed: std::sync::atomic::AtomicBool,
}

impl SqliteYStore {
    /// Open a store scoped to `room`, creating its tables if this is the
    /// first time any room has used this pool.
    pub async fn open(pool: SqlitePool, room: impl Into<String>) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room TEXT NOT NULL,
                data BLOB NOT NULL,
                metadata BLOB NOT NULL,
                ts REAL NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_store_meta (
                room TEXT PRIMARY KEY,
                format_version INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS sync_updates_room_idx ON sync_updates (room, id)")
            .execute(&pool)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let room = room.into();
        let existing = sqlx::query("SELECT format_version FROM sync_store_meta WHERE room = ?")
            .bind(&room)
            .fetch_optional(&pool)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        match existing {
            Some(row) => {
                let found: i64 = row.try_get("format_version").map_err(|e| Error::Internal(e.to_string()))?;
                if found as u64 != FORMAT_VERSION {
                    return Err(Error::StoreVersionMismatch { expected: FORMAT_VERSION, found: found as u64 });
                }
            }
            None => {
                sqlx::query("INSERT INTO sync_store_meta (room, format_version) VALUES (?, ?)")
                    .bind(&room)
                    .bind(FORMAT_VERSION as i64)
                    .execute(&pool)
                    .await
                    .map_err(|e| Error::Internal(e.to_string()))?;
            }
        }

        Ok(Self { pool, room, closed: std::sync::atomic::AtomicBool::new(false) })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateStore for SqliteYStore {
    async fn append(&self, update: &[u8], metadata: &[u8]) -> Result<()> {
        self.check_open()?;
        let ts = Timestamp::now();
        sqlx::query("INSERT INTO sync_updates (room, data, metadata, ts) VALUES (?, ?, ?, ?)")
            .bind(&self.room)
            .bind(update)
            .bind(metadata)
            .bind(ts.0)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<(Vec<u8>, Vec<u8>, Timestamp)>> {
        self.check_open()?;
        let rows = sqlx::query("SELECT data, metadata, ts FROM sync_updates WHERE room = ? ORDER BY id ASC")
            .bind(&self.room)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let data: Vec<u8> = row.try_get("data").map_err(|e| Error::Internal(e.to_string()))?;
                let metadata: Vec<u8> = row.try_get("metadata").map_err(|e| Error::Internal(e.to_string()))?;
                let ts: f64 = row.try_get("ts").map_err(|e| Error::Internal(e.to_string()))?;
                Ok((data, metadata, Timestamp(ts)))
            })
            .collect()
    }

    async fn squash(&self, squashed: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut txn = self.pool.begin().await.map_err(|e| Error::Internal(e.to_string()))?;
        sqlx::query("DELETE FROM sync_updates WHERE room = ?")
            .bind(&self.room)
            .execute(&mut *txn)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        sqlx::query("INSERT INTO sync_updates (room, data, metadata, ts) VALUES (?, ?, ?, ?)")
            .bind(&self.room)
            .bind(squashed)
            .bind(&b""[..])
            .bind(Timestamp::now().0)
            .execute(&mut *txn)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        txn.commit().await.map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> SqlitePool {
        SqlitePool::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn append_then_load_round_trips_in_order() {
        let store = SqliteYStore::open(pool().await, "room-1").await.unwrap();
        store.append(b"one", b"alice").await.unwrap();
        store.append(b"two", b"bob").await.unwrap();

        let records = store.load().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, b"one");
        assert_eq!(records[0].1, b"alice");
        assert_eq!(records[1].0, b"two");
        assert_eq!(records[1].1, b"bob");
    }

    #[tokio::test]
    async fn rooms_do_not_see_each_others_updates() {
        let pool = pool().await;
        let a = SqliteYStore::open(pool.clone(), "room-a").await.unwrap();
        let b = SqliteYStore::open(pool, "room-b").await.unwrap();
        a.append(b"a-data", b"").await.unwrap();
        assert!(b.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn squash_replaces_history_but_preserves_state() {
        let store = SqliteYStore::open(pool().await, "room-1").await.unwrap();
        store.append(b"one", b"").await.unwrap();
        store.append(b"two", b"").await.unwrap();
        store.squash(b"merged").await.unwrap();

        let records = store.load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, b"merged");
    }

    #[tokio::test]
    async fn closed_store_rejects_further_operations() {
        let store = SqliteYStore::open(pool().await, "room-1").await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(store.append(b"x", b"").await, Err(Error::StoreClosed)));
        assert!(matches!(store.load().await, Err(Error::StoreClosed)));
    }
}

//! Durable state: scan cursor, notification outbox and drain locks.
//!
//! PostgreSQL is the authority when several worker processes share one
//! deployment; `MemoryStore` serves tests and database-less runs.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sqlx::PgPool;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::StoreError;
use crate::db::SafeRow;

/// Setting name holding the scan cursor
pub const CURSOR_KEY: &str = "last_block";

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self) -> Result<Option<u64>, StoreError>;

    /// Persist `block`; a value below the stored cursor is rejected.
    async fn save_cursor(&self, block: u64) -> Result<(), StoreError>;
}

/// Notification waiting for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: i64,
    pub symbol: String,
    pub txid: String,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns `true` if the entry was new
    async fn enqueue(&self, symbol: &str, txid: &str) -> Result<bool, StoreError>;

    /// Oldest undelivered entries first
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    async fn mark_delivered(&self, id: i64) -> Result<(), StoreError>;
}

/// Identifies one acquisition of a lock
pub type LockToken = i64;

/// Leased locks. A holder that stops renewing for `lock_ttl` loses the lock
/// to the next caller; renew and release act only under the holder's token.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// `Some(token)` if the lock was taken by this call
    async fn try_acquire(&self, key: &str) -> Result<Option<LockToken>, StoreError>;

    /// Extend the lease; `false` once the lock belongs to someone else
    async fn renew(&self, key: &str, token: LockToken) -> Result<bool, StoreError>;

    /// No-op if the lock is no longer held under `token`
    async fn release(&self, key: &str, token: LockToken) -> Result<(), StoreError>;

    fn lock_ttl(&self) -> Duration;
}

fn parse_cursor(value: &str) -> Result<u64, StoreError> {
    value.trim().parse().map_err(|_| StoreError::Corrupt {
        name: CURSOR_KEY.to_string(),
        value: value.to_string(),
    })
}

// ============================================================
// POSTGRES
// ============================================================

pub struct PgStore {
    pool: PgPool,
    lock_ttl: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, lock_ttl: Duration) -> Self {
        Self { pool, lock_ttl }
    }

    /// Create the sentinel-owned tables if they do not exist
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS settings (
                   name TEXT PRIMARY KEY,
                   value TEXT NOT NULL
               )"#,
            r#"CREATE TABLE IF NOT EXISTS notify_outbox (
                   id BIGSERIAL PRIMARY KEY,
                   symbol TEXT NOT NULL,
                   txid TEXT NOT NULL,
                   created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                   delivered_at TIMESTAMPTZ,
                   UNIQUE (symbol, txid)
               )"#,
            "CREATE SEQUENCE IF NOT EXISTS drain_lock_tokens",
            r#"CREATE TABLE IF NOT EXISTS drain_locks (
                   lock_key TEXT PRIMARY KEY,
                   token BIGINT NOT NULL DEFAULT 0,
                   acquired_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
               )"#,
            "ALTER TABLE drain_locks ADD COLUMN IF NOT EXISTS token BIGINT NOT NULL DEFAULT 0",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Sentinel schema ready");
        Ok(())
    }
}

#[async_trait]
impl CursorStore for PgStore {
    async fn load_cursor(&self) -> Result<Option<u64>, StoreError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM settings WHERE name = $1")
                .bind(CURSOR_KEY)
                .fetch_optional(&self.pool)
                .await?;

        value.as_deref().map(parse_cursor).transpose()
    }

    async fn save_cursor(&self, block: u64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO settings (name, value)
               VALUES ($1, $2)
               ON CONFLICT (name) DO UPDATE
               SET value = EXCLUDED.value
               WHERE settings.value::NUMERIC <= EXCLUDED.value::NUMERIC"#,
        )
        .bind(CURSOR_KEY)
        .bind(block.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let stored = self.load_cursor().await?.unwrap_or_default();
            return Err(StoreError::CursorRegression {
                stored,
                attempted: block,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn enqueue(&self, symbol: &str, txid: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO notify_outbox (symbol, txid)
               VALUES ($1, $2)
               ON CONFLICT (symbol, txid) DO NOTHING"#,
        )
        .bind(symbol)
        .bind(txid)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, symbol, txid FROM notify_outbox
               WHERE delivered_at IS NULL
               ORDER BY id
               LIMIT $1"#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(OutboxEntry {
                    id: row.try_get_log("id")?,
                    symbol: row.try_get_log("symbol")?,
                    txid: row.try_get_log("txid")?,
                })
            })
            .collect())
    }

    async fn mark_delivered(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE notify_outbox SET delivered_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LockStore for PgStore {
    async fn try_acquire(&self, key: &str) -> Result<Option<LockToken>, StoreError> {
        // An expired lease belongs to a crashed holder and is taken over.
        let token: Option<i64> = sqlx::query_scalar(
            r#"INSERT INTO drain_locks (lock_key, token, acquired_at)
               VALUES ($1, nextval('drain_lock_tokens'), NOW())
               ON CONFLICT (lock_key) DO UPDATE
               SET token = EXCLUDED.token, acquired_at = NOW()
               WHERE drain_locks.acquired_at < NOW() - make_interval(secs => $2)
               RETURNING token"#,
        )
        .bind(key)
        .bind(self.lock_ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(token)
    }

    async fn renew(&self, key: &str, token: LockToken) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE drain_locks SET acquired_at = NOW()
               WHERE lock_key = $1 AND token = $2"#,
        )
        .bind(key)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str, token: LockToken) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM drain_locks WHERE lock_key = $1 AND token = $2")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }
}

// ============================================================
// IN-MEMORY
// ============================================================

/// Delivered keys remembered so a replayed batch does not notify twice
pub const DELIVERED_RETAINED: usize = 10_000;

struct MemoryOutboxRow {
    symbol: String,
    txid: String,
}

pub struct MemoryStore {
    cursor: Mutex<Option<u64>>,
    /// Undelivered entries only
    outbox: DashMap<i64, MemoryOutboxRow>,
    /// (symbol, txid) -> outbox id, pending or recently delivered
    outbox_index: DashMap<(String, String), i64>,
    /// Delivered keys, oldest first
    delivered: Mutex<VecDeque<(String, String)>>,
    delivered_retained: usize,
    next_id: AtomicI64,
    /// key -> (holder token, last renewal)
    locks: DashMap<String, (LockToken, Instant)>,
    next_token: AtomicI64,
    lock_ttl: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_ttl(Duration::from_secs(600))
    }

    pub fn with_lock_ttl(lock_ttl: Duration) -> Self {
        Self {
            cursor: Mutex::new(None),
            outbox: DashMap::new(),
            outbox_index: DashMap::new(),
            delivered: Mutex::new(VecDeque::new()),
            delivered_retained: DELIVERED_RETAINED,
            next_id: AtomicI64::new(1),
            locks: DashMap::new(),
            next_token: AtomicI64::new(1),
            lock_ttl,
        }
    }

    pub fn with_delivered_retention(mut self, retained: usize) -> Self {
        self.delivered_retained = retained;
        self
    }

    /// Entries still waiting for delivery
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn is_delivered(&self, symbol: &str, txid: &str) -> bool {
        self.outbox_index
            .get(&(symbol.to_string(), txid.to_string()))
            .is_some_and(|id| !self.outbox.contains_key(&*id))
    }

    /// Pending and retained delivered transaction ids for `symbol`, in
    /// enqueue order
    pub fn enqueued(&self, symbol: &str) -> Vec<String> {
        let mut rows: Vec<(i64, String)> = self
            .outbox_index
            .iter()
            .filter(|entry| entry.key().0 == symbol)
            .map(|entry| (*entry.value(), entry.key().1.clone()))
            .collect();
        rows.sort();
        rows.into_iter().map(|(_, txid)| txid).collect()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load_cursor(&self) -> Result<Option<u64>, StoreError> {
        Ok(*self.cursor.lock().await)
    }

    async fn save_cursor(&self, block: u64) -> Result<(), StoreError> {
        let mut cursor = self.cursor.lock().await;
        if let Some(stored) = *cursor
            && block < stored
        {
            return Err(StoreError::CursorRegression {
                stored,
                attempted: block,
            });
        }
        *cursor = Some(block);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn enqueue(&self, symbol: &str, txid: &str) -> Result<bool, StoreError> {
        match self
            .outbox_index
            .entry((symbol.to_string(), txid.to_string()))
        {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                self.outbox.insert(
                    id,
                    MemoryOutboxRow {
                        symbol: symbol.to_string(),
                        txid: txid.to_string(),
                    },
                );
                slot.insert(id);
                Ok(true)
            }
        }
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut entries: Vec<OutboxEntry> = self
            .outbox
            .iter()
            .map(|row| OutboxEntry {
                id: *row.key(),
                symbol: row.symbol.clone(),
                txid: row.txid.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn mark_delivered(&self, id: i64) -> Result<(), StoreError> {
        let Some((_, row)) = self.outbox.remove(&id) else {
            warn!("Outbox entry {} not found", id);
            return Ok(());
        };

        let mut delivered = self.delivered.lock().await;
        delivered.push_back((row.symbol, row.txid));
        while delivered.len() > self.delivered_retained {
            if let Some(key) = delivered.pop_front() {
                self.outbox_index.remove(&key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(&self, key: &str) -> Result<Option<LockToken>, StoreError> {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().1.elapsed() >= self.lock_ttl {
                    debug!("Lock {} expired, taking over", key);
                    held.insert((token, Instant::now()));
                    Ok(Some(token))
                } else {
                    Ok(None)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert((token, Instant::now()));
                Ok(Some(token))
            }
        }
    }

    async fn renew(&self, key: &str, token: LockToken) -> Result<bool, StoreError> {
        match self.locks.get_mut(key) {
            Some(mut held) if held.0 == token => {
                held.1 = Instant::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: LockToken) -> Result<(), StoreError> {
        self.locks.remove_if(key, |_, held| held.0 == token);
        Ok(())
    }

    fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cursor_never_regresses() {
        let store = MemoryStore::new();
        assert_eq!(store.load_cursor().await.unwrap(), None);

        store.save_cursor(100).await.unwrap();
        store.save_cursor(105).await.unwrap();
        store.save_cursor(105).await.unwrap();

        let err = store.save_cursor(90).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::CursorRegression {
                stored: 105,
                attempted: 90
            }
        ));
        assert_eq!(store.load_cursor().await.unwrap(), Some(105));
    }

    #[tokio::test]
    async fn test_outbox_enqueue_is_idempotent() {
        let store = MemoryStore::new();
        assert!(store.enqueue("ETH", "0xaa").await.unwrap());
        assert!(!store.enqueue("ETH", "0xaa").await.unwrap());
        assert!(store.enqueue("USDT", "0xaa").await.unwrap());

        let pending = store.pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].symbol, "ETH");

        store.mark_delivered(pending[0].id).await.unwrap();
        assert!(store.is_delivered("ETH", "0xaa"));
        assert_eq!(store.pending(10).await.unwrap().len(), 1);

        // Delivered entries are not re-enqueued by a replayed batch
        assert!(!store.enqueue("ETH", "0xaa").await.unwrap());
    }

    #[tokio::test]
    async fn test_delivered_entries_are_evicted_past_retention() {
        let store = MemoryStore::new().with_delivered_retention(2);
        for i in 0..5 {
            let txid = format!("0x{:02x}", i);
            store.enqueue("ETH", &txid).await.unwrap();
            let id = store.pending(1).await.unwrap()[0].id;
            store.mark_delivered(id).await.unwrap();
        }

        assert_eq!(store.outbox_len(), 0);
        assert_eq!(store.enqueued("ETH"), vec!["0x03", "0x04"]);
        assert!(store.is_delivered("ETH", "0x04"));
        assert!(!store.is_delivered("ETH", "0x00"));
        // still remembered, so not enqueued again
        assert!(!store.enqueue("ETH", "0x04").await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_respects_limit_and_order() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.enqueue("ETH", &format!("0x{:02x}", i)).await.unwrap();
        }
        let pending = store.pending(3).await.unwrap();
        let txids: Vec<&str> = pending.iter().map(|e| e.txid.as_str()).collect();
        assert_eq!(txids, vec!["0x00", "0x01", "0x02"]);
    }

    #[tokio::test]
    async fn test_lock_single_holder_and_release() {
        let store = MemoryStore::new();
        let token = store.try_acquire("ETH:0xabc").await.unwrap().unwrap();
        assert!(store.try_acquire("ETH:0xabc").await.unwrap().is_none());
        assert!(store.try_acquire("USDT:0xabc").await.unwrap().is_some());

        store.release("ETH:0xabc", token).await.unwrap();
        assert!(store.try_acquire("ETH:0xabc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let store = MemoryStore::with_lock_ttl(Duration::from_millis(10));
        assert!(store.try_acquire("ETH:0xabc").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.try_acquire("ETH:0xabc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_or_renew_taken_over_lock() {
        let store = MemoryStore::with_lock_ttl(Duration::from_millis(10));
        let stale = store.try_acquire("ETH:0xabc").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let current = store.try_acquire("ETH:0xabc").await.unwrap().unwrap();
        assert_ne!(stale, current);

        store.release("ETH:0xabc", stale).await.unwrap();
        assert!(store.is_locked("ETH:0xabc"));
        assert!(!store.renew("ETH:0xabc", stale).await.unwrap());

        assert!(store.renew("ETH:0xabc", current).await.unwrap());
        store.release("ETH:0xabc", current).await.unwrap();
        assert!(!store.is_locked("ETH:0xabc"));
    }

    #[tokio::test]
    async fn test_renewed_lock_is_not_taken_over() {
        let store = MemoryStore::with_lock_ttl(Duration::from_millis(30));
        let token = store.try_acquire("ETH:0xabc").await.unwrap().unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            assert!(store.renew("ETH:0xabc", token).await.unwrap());
        }
        assert!(store.try_acquire("ETH:0xabc").await.unwrap().is_none());
    }

    #[test]
    fn test_parse_cursor_rejects_garbage() {
        assert_eq!(parse_cursor("42").unwrap(), 42);
        assert!(matches!(parse_cursor("abc"), Err(StoreError::Corrupt { .. })));
    }
}

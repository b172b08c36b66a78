//! Two-tier embedding cache: a bounded in-memory tier over a durable SQLite
//! table, keyed by content fingerprint. Writes go to the memory tier
//! immediately and reach the table through a write-behind buffer drained by
//! a dedicated flusher task.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use quick_cache::sync::Cache as QuickCache;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::fingerprint::{from_db_key, to_db_key};

const CACHE_DB_FILE: &str = "embedding_cache.db";

struct WriteEntry {
    fp: u64,
    bytes: Vec<u8>,
    created_at: i64,
}

pub struct EmbeddingCache {
    /// Bounded LRU tier. Behind a lock only so `clear()` can swap it out.
    l1: RwLock<QuickCache<u64, Arc<Vec<f32>>>>,
    pool: SqlitePool,
    dim: usize,
    cfg: CacheConfig,
    buffer: Mutex<VecDeque<WriteEntry>>,
    /// Set while a drain is scheduled/running; prevents concurrent flushers.
    flush_pending: AtomicBool,
    wake: Notify,
    stop: AtomicBool,
}

impl EmbeddingCache {
    /// Open (or create) `embedding_cache.db` under `db_dir`. `dim` is the
    /// provider-declared vector dimension used to validate entries.
    pub async fn open(db_dir: &Path, dim: usize, cfg: CacheConfig) -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::new()
            .filename(db_dir.join(CACHE_DB_FILE))
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(Error::cache)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS embedding_cache (
                fp INTEGER PRIMARY KEY,
                embedding BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(Error::cache)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_embedding_cache_created_at
             ON embedding_cache(created_at)",
        )
        .execute(&pool)
        .await
        .map_err(Error::cache)?;

        Ok(Arc::new(Self {
            l1: RwLock::new(QuickCache::new(cfg.max_in_memory)),
            pool,
            dim,
            cfg,
            buffer: Mutex::new(VecDeque::new()),
            flush_pending: AtomicBool::new(false),
            wake: Notify::new(),
            stop: AtomicBool::new(false),
        }))
    }

    /// Background flusher: drains the write buffer every `flush_interval_ms`
    /// or as soon as a batch worth of entries (or an overflow) accumulates.
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(cache.cfg.flush_interval_ms.max(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = cache.wake.notified() => {}
                }
                if cache.stop.load(Ordering::Acquire) {
                    break;
                }
                // Drain repeatedly while full batches remain so an overflow
                // burst does not wait a full interval per batch.
                loop {
                    cache.flush_one_batch().await;
                    if cache.buffer.lock().len() < cache.cfg.batch_size {
                        break;
                    }
                }
            }
        })
    }

    pub fn stop_flusher(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    /// L1 hit returns immediately; an L1 miss consults the durable tier and
    /// promotes. I/O errors degrade to a miss.
    pub async fn get(&self, fp: u64) -> Option<Vec<f32>> {
        // Bind outside the `if let` so the read guard is not held across the
        // invalidation below.
        let hit = self.l1.read().get(&fp);
        if let Some(hit) = hit {
            if hit.len() == self.dim {
                return Some(hit.as_ref().clone());
            }
            // Length mismatch: invalidate and fall through to the durable
            // tier; do not attempt repair.
            self.l1.read().remove(&fp);
        }

        let row = sqlx::query("SELECT embedding FROM embedding_cache WHERE fp = ?")
            .bind(to_db_key(fp))
            .fetch_optional(&self.pool)
            .await;
        let row = match row {
            Ok(r) => r?,
            Err(e) => {
                tracing::warn!(error = %e, "embedding cache read failed, degrading to miss");
                return None;
            }
        };

        let bytes: Vec<u8> = row.get(0);
        let vector = decode_vector(&bytes, self.dim)?;
        self.l1.read().insert(fp, Arc::new(vector.clone()));
        Some(vector)
    }

    /// One L1 scan followed by a single batched lookup for the misses.
    pub async fn get_all(&self, fps: &[u64]) -> HashMap<u64, Vec<f32>> {
        let mut found = HashMap::with_capacity(fps.len());
        let mut misses = Vec::new();
        {
            let l1 = self.l1.read();
            for &fp in fps {
                match l1.get(&fp) {
                    Some(hit) if hit.len() == self.dim => {
                        found.insert(fp, hit.as_ref().clone());
                    }
                    Some(_) => {
                        l1.remove(&fp);
                        misses.push(fp);
                    }
                    None => misses.push(fp),
                }
            }
        }

        for chunk in misses.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT fp, embedding FROM embedding_cache WHERE fp IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql);
            for &fp in chunk {
                query = query.bind(to_db_key(fp));
            }
            let rows = match query.fetch_all(&self.pool).await {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(error = %e, "embedding cache batch read failed");
                    continue;
                }
            };
            for row in rows {
                let fp = from_db_key(row.get::<i64, _>(0));
                let bytes: Vec<u8> = row.get(1);
                if let Some(vector) = decode_vector(&bytes, self.dim) {
                    self.l1.read().insert(fp, Arc::new(vector.clone()));
                    found.insert(fp, vector);
                }
            }
        }
        found
    }

    // ── Writes ────────────────────────────────────────────────────────────

    /// Populate L1 and enqueue the durable write. Never blocks on I/O.
    pub fn put(&self, fp: u64, vector: Vec<f32>) {
        let bytes = encode_vector(&vector);
        self.l1.read().insert(fp, Arc::new(vector));

        let len = {
            let mut buffer = self.buffer.lock();
            buffer.push_back(WriteEntry {
                fp,
                bytes,
                created_at: chrono::Utc::now().timestamp_millis(),
            });
            buffer.len()
        };

        if len >= self.cfg.batch_size {
            self.wake.notify_one();
        }
        if len > self.cfg.max_buffer && !self.flush_pending.swap(true, Ordering::AcqRel) {
            self.wake.notify_one();
        }
    }

    pub fn put_all(&self, entries: impl IntoIterator<Item = (u64, Vec<f32>)>) {
        for (fp, vector) in entries {
            self.put(fp, vector);
        }
    }

    /// Drain one batch and upsert it in a single transaction. Dropped (with
    /// a warning) on I/O failure — the memory tier still has the entries.
    async fn flush_one_batch(&self) {
        self.flush_pending.store(true, Ordering::Release);
        let batch: Vec<WriteEntry> = {
            let mut buffer = self.buffer.lock();
            let n = buffer.len().min(self.cfg.batch_size);
            buffer.drain(..n).collect()
        };
        if batch.is_empty() {
            self.flush_pending.store(false, Ordering::Release);
            return;
        }

        if let Err(e) = self.upsert_batch(&batch).await {
            tracing::warn!(error = %e, dropped = batch.len(), "embedding cache flush failed");
        }
        self.flush_pending.store(false, Ordering::Release);
    }

    async fn upsert_batch(&self, batch: &[WriteEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::cache)?;
        for entry in batch {
            sqlx::query(
                "INSERT INTO embedding_cache (fp, embedding, created_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT(fp) DO UPDATE SET
                     embedding = excluded.embedding,
                     created_at = excluded.created_at",
            )
            .bind(to_db_key(entry.fp))
            .bind(&entry.bytes)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(Error::cache)?;
        }
        tx.commit().await.map_err(Error::cache)
    }

    /// Drain the whole buffer synchronously-with-respect-to the caller.
    pub async fn flush(&self) -> Result<()> {
        loop {
            let batch: Vec<WriteEntry> = {
                let mut buffer = self.buffer.lock();
                let n = buffer.len().min(self.cfg.batch_size);
                buffer.drain(..n).collect()
            };
            if batch.is_empty() {
                return Ok(());
            }
            self.upsert_batch(&batch).await?;
        }
    }

    /// Drop pending writes, truncate the durable table, reset L1.
    pub async fn clear(&self) -> Result<()> {
        self.buffer.lock().clear();
        *self.l1.write() = QuickCache::new(self.cfg.max_in_memory);
        sqlx::query("DELETE FROM embedding_cache")
            .execute(&self.pool)
            .await
            .map_err(Error::cache)?;
        Ok(())
    }

    /// Authoritative entry count (the durable tier).
    pub async fn size(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::cache)?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    /// Evict a single entry from the memory tier (the durable row stays).
    pub fn evict_from_memory(&self, fp: u64) {
        self.l1.read().remove(&fp);
    }

    pub fn pending_writes(&self) -> usize {
        self.buffer.lock().len()
    }
}

/// Raw little-endian f32 bytes, length `dim * 4`.
fn encode_vector(v: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for x in v {
        bytes.extend_from_slice(&x.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8], dim: usize) -> Option<Vec<f32>> {
    if bytes.len() != dim * 4 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

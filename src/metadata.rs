//! Persistent metadata store: containers, their block coordinates (with an
//! R-tree spatial index), and the indexed item rows that own the ordinals
//! used by the vector index. Ordinals are `AUTOINCREMENT`, so they are
//! monotonic and never reused for the life of the store.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::fingerprint::{from_db_key, to_db_key};
use crate::item::{BlockPos, ContainerPath, ContainerRef, Location};

const METADATA_DB_FILE: &str = "metadata.db";

#[derive(Debug, Clone)]
pub struct ItemRow {
    pub ordinal: i64,
    pub container_id: String,
    pub slot: u32,
    pub container_path: ContainerPath,
    pub fingerprint: u64,
    pub storage_record: Vec<u8>,
    pub indexed_at: i64,
}

#[derive(Debug, Clone)]
pub struct ContainerRow {
    pub container_id: String,
    pub world: String,
    pub container_type: String,
    pub blocks: Vec<BlockPos>,
    pub last_indexed_at: i64,
    pub item_ordinals: Vec<i64>,
}

impl ContainerRow {
    /// Primary location: lexicographically smallest block coordinate.
    pub fn primary_location(&self) -> Option<Location> {
        self.blocks.iter().min().map(|pos| Location {
            world: self.world.clone(),
            pos: *pos,
        })
    }
}

pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub async fn open(db_dir: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_dir.join(METADATA_DB_FILE))
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(Error::metadata)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for sql in [
            "CREATE TABLE IF NOT EXISTS containers (
                container_id TEXT PRIMARY KEY,
                world TEXT NOT NULL,
                container_type TEXT NOT NULL DEFAULT '',
                last_indexed_at INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS container_blocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                container_id TEXT NOT NULL
                    REFERENCES containers(container_id) ON DELETE CASCADE,
                world TEXT NOT NULL,
                x INTEGER NOT NULL,
                y INTEGER NOT NULL,
                z INTEGER NOT NULL,
                UNIQUE(world, x, y, z)
            )",
            "CREATE INDEX IF NOT EXISTS idx_container_blocks_container
                ON container_blocks(container_id)",
            "CREATE VIRTUAL TABLE IF NOT EXISTS container_blocks_rtree USING rtree(
                id, min_x, max_x, min_y, max_y, min_z, max_z
            )",
            "CREATE TABLE IF NOT EXISTS items (
                ordinal INTEGER PRIMARY KEY AUTOINCREMENT,
                container_id TEXT NOT NULL
                    REFERENCES containers(container_id) ON DELETE CASCADE,
                slot INTEGER NOT NULL,
                container_path TEXT NOT NULL,
                fingerprint INTEGER NOT NULL,
                storage_record BLOB NOT NULL,
                indexed_at INTEGER NOT NULL,
                UNIQUE(container_id, slot, container_path)
            )",
            "CREATE INDEX IF NOT EXISTS idx_items_container ON items(container_id)",
        ] {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(Error::metadata)?;
        }
        Ok(())
    }

    // ── Containers ────────────────────────────────────────────────────────

    /// Resolve the container covering `blocks`, creating it when unseen.
    /// Multi-block inventories map every block to the same stable id.
    pub async fn upsert_container(
        &self,
        world: &str,
        blocks: &[BlockPos],
        container_type: &str,
    ) -> Result<String> {
        if blocks.is_empty() {
            return Err(Error::InvalidInput("container has no blocks".to_string()));
        }

        let mut tx = self.pool.begin().await.map_err(Error::metadata)?;

        // Any known block resolves the id for the whole inventory.
        let mut existing: Option<String> = None;
        for pos in blocks {
            let row = sqlx::query(
                "SELECT container_id FROM container_blocks
                 WHERE world = ? AND x = ? AND y = ? AND z = ?",
            )
            .bind(world)
            .bind(pos.x)
            .bind(pos.y)
            .bind(pos.z)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::metadata)?;
            if let Some(row) = row {
                existing = Some(row.get::<String, _>(0));
                break;
            }
        }

        let container_id = match existing {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO containers (container_id, world, container_type, last_indexed_at)
                     VALUES (?, ?, ?, 0)",
                )
                .bind(&id)
                .bind(world)
                .bind(container_type)
                .execute(&mut *tx)
                .await
                .map_err(Error::metadata)?;
                id
            }
        };

        // Register any blocks not yet attached (a single chest grown into a
        // double chest gains its second block here).
        for pos in blocks {
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO container_blocks (container_id, world, x, y, z)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&container_id)
            .bind(world)
            .bind(pos.x)
            .bind(pos.y)
            .bind(pos.z)
            .execute(&mut *tx)
            .await
            .map_err(Error::metadata)?;
            if inserted.rows_affected() > 0 {
                let row_id = inserted.last_insert_rowid();
                sqlx::query(
                    "INSERT INTO container_blocks_rtree
                        (id, min_x, max_x, min_y, max_y, min_z, max_z)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(row_id)
                .bind(f64::from(pos.x))
                .bind(f64::from(pos.x))
                .bind(f64::from(pos.y))
                .bind(f64::from(pos.y))
                .bind(f64::from(pos.z))
                .bind(f64::from(pos.z))
                .execute(&mut *tx)
                .await
                .map_err(Error::metadata)?;
            }
        }

        tx.commit().await.map_err(Error::metadata)?;
        Ok(container_id)
    }

    pub async fn touch_container(&self, container_id: &str) -> Result<()> {
        sqlx::query("UPDATE containers SET last_indexed_at = ? WHERE container_id = ?")
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(container_id)
            .execute(&self.pool)
            .await
            .map_err(Error::metadata)?;
        Ok(())
    }

    pub async fn delete_container(&self, container_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::metadata)?;
        sqlx::query(
            "DELETE FROM container_blocks_rtree WHERE id IN
                (SELECT id FROM container_blocks WHERE container_id = ?)",
        )
        .bind(container_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::metadata)?;
        // Blocks and items cascade.
        sqlx::query("DELETE FROM containers WHERE container_id = ?")
            .bind(container_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::metadata)?;
        tx.commit().await.map_err(Error::metadata)
    }

    pub async fn get_container(&self, container_id: &str) -> Result<Option<ContainerRow>> {
        let row = sqlx::query(
            "SELECT container_id, world, container_type, last_indexed_at
             FROM containers WHERE container_id = ?",
        )
        .bind(container_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::metadata)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(self.hydrate_container(row).await?))
    }

    pub async fn all_containers(&self) -> Result<Vec<ContainerRow>> {
        let rows = sqlx::query(
            "SELECT container_id, world, container_type, last_indexed_at
             FROM containers ORDER BY container_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::metadata)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.hydrate_container(row).await?);
        }
        Ok(out)
    }

    async fn hydrate_container(&self, row: sqlx::sqlite::SqliteRow) -> Result<ContainerRow> {
        let container_id: String = row.get(0);

        let block_rows = sqlx::query(
            "SELECT x, y, z FROM container_blocks WHERE container_id = ? ORDER BY x, y, z",
        )
        .bind(&container_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::metadata)?;
        let blocks = block_rows
            .iter()
            .map(|b| BlockPos::new(b.get(0), b.get(1), b.get(2)))
            .collect();

        let ordinal_rows =
            sqlx::query("SELECT ordinal FROM items WHERE container_id = ? ORDER BY ordinal")
                .bind(&container_id)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::metadata)?;
        let item_ordinals = ordinal_rows.iter().map(|r| r.get::<i64, _>(0)).collect();

        Ok(ContainerRow {
            container_id,
            world: row.get(1),
            container_type: row.get(2),
            blocks,
            last_indexed_at: row.get(3),
            item_ordinals,
        })
    }

    /// Containers with at least one block inside the axis-aligned cube of
    /// half-extent `radius` around the center. The exact-distance cut is the
    /// caller's (the R-tree over-approximates by design).
    pub async fn containers_in_radius(
        &self,
        world: &str,
        center: BlockPos,
        radius: f64,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT b.container_id
             FROM container_blocks_rtree r
             JOIN container_blocks b ON b.id = r.id
             WHERE b.world = ?
               AND r.min_x <= ? AND r.max_x >= ?
               AND r.min_y <= ? AND r.max_y >= ?
               AND r.min_z <= ? AND r.max_z >= ?",
        )
        .bind(world)
        .bind(f64::from(center.x) + radius)
        .bind(f64::from(center.x) - radius)
        .bind(f64::from(center.y) + radius)
        .bind(f64::from(center.y) - radius)
        .bind(f64::from(center.z) + radius)
        .bind(f64::from(center.z) - radius)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::metadata)?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    // ── Items ─────────────────────────────────────────────────────────────

    /// Insert or replace the item at `(container, slot, path)`. A new triple
    /// gets a fresh ordinal; an existing one keeps its ordinal and has its
    /// fingerprint/record replaced.
    pub async fn upsert_item(
        &self,
        container_id: &str,
        slot: u32,
        container_path: &[ContainerRef],
        fingerprint: u64,
        storage_record: &[u8],
    ) -> Result<i64> {
        let path_json = path_to_json(container_path);
        let row = sqlx::query(
            "INSERT INTO items
                (container_id, slot, container_path, fingerprint, storage_record, indexed_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(container_id, slot, container_path) DO UPDATE SET
                 fingerprint = excluded.fingerprint,
                 storage_record = excluded.storage_record,
                 indexed_at = excluded.indexed_at
             RETURNING ordinal",
        )
        .bind(container_id)
        .bind(slot as i64)
        .bind(&path_json)
        .bind(to_db_key(fingerprint))
        .bind(storage_record)
        .bind(chrono::Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::metadata)?;
        Ok(row.get(0))
    }

    pub async fn delete_item(&self, ordinal: i64) -> Result<()> {
        sqlx::query("DELETE FROM items WHERE ordinal = ?")
            .bind(ordinal)
            .execute(&self.pool)
            .await
            .map_err(Error::metadata)?;
        Ok(())
    }

    pub async fn get_items_by_container(&self, container_id: &str) -> Result<Vec<ItemRow>> {
        let rows = sqlx::query(
            "SELECT ordinal, container_id, slot, container_path, fingerprint,
                    storage_record, indexed_at
             FROM items WHERE container_id = ? ORDER BY ordinal",
        )
        .bind(container_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::metadata)?;
        Ok(rows.into_iter().map(decode_item_row).collect())
    }

    pub async fn get_row(&self, ordinal: i64) -> Result<Option<ItemRow>> {
        let row = sqlx::query(
            "SELECT ordinal, container_id, slot, container_path, fingerprint,
                    storage_record, indexed_at
             FROM items WHERE ordinal = ?",
        )
        .bind(ordinal)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::metadata)?;
        Ok(row.map(decode_item_row))
    }

    pub async fn get_rows(&self, ordinals: &[i64]) -> Result<HashMap<i64, ItemRow>> {
        let mut out = HashMap::with_capacity(ordinals.len());
        for chunk in ordinals.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT ordinal, container_id, slot, container_path, fingerprint,
                        storage_record, indexed_at
                 FROM items WHERE ordinal IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql);
            for &ord in chunk {
                query = query.bind(ord);
            }
            let rows = query.fetch_all(&self.pool).await.map_err(Error::metadata)?;
            for row in rows {
                let item = decode_item_row(row);
                out.insert(item.ordinal, item);
            }
        }
        Ok(out)
    }

    /// Every live ordinal; used at startup to seed the vector index.
    pub async fn all_ordinals(&self) -> Result<HashSet<i64>> {
        let rows = sqlx::query("SELECT ordinal FROM items")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::metadata)?;
        Ok(rows.iter().map(|r| r.get::<i64, _>(0)).collect())
    }

    /// `(ordinal, fingerprint)` pairs for cache-backed vector seeding.
    pub async fn all_item_fingerprints(&self) -> Result<Vec<(i64, u64)>> {
        let rows = sqlx::query("SELECT ordinal, fingerprint FROM items")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::metadata)?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<i64, _>(0), from_db_key(r.get::<i64, _>(1))))
            .collect())
    }

    pub async fn count_items(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::metadata)?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    pub async fn count_containers(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM containers")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::metadata)?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    /// Wipe everything. Ordinal assignment stays monotonic because the
    /// AUTOINCREMENT sequence survives row deletion.
    pub async fn purge_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::metadata)?;
        for sql in [
            "DELETE FROM items",
            "DELETE FROM container_blocks_rtree",
            "DELETE FROM container_blocks",
            "DELETE FROM containers",
        ] {
            sqlx::query(sql)
                .execute(&mut *tx)
                .await
                .map_err(Error::metadata)?;
        }
        tx.commit().await.map_err(Error::metadata)
    }
}

/// Canonical JSON for the path column; `[]` at the root so the UNIQUE
/// constraint treats root items uniformly.
pub fn path_to_json(path: &[ContainerRef]) -> String {
    serde_json::to_string(path).unwrap_or_else(|_| "[]".to_string())
}

fn decode_item_row(row: sqlx::sqlite::SqliteRow) -> ItemRow {
    let path_json: String = row.get(3);
    ItemRow {
        ordinal: row.get(0),
        container_id: row.get(1),
        slot: row.get::<i64, _>(2) as u32,
        container_path: serde_json::from_str(&path_json).unwrap_or_default(),
        fingerprint: from_db_key(row.get::<i64, _>(4)),
        storage_record: row.get(5),
        indexed_at: row.get(6),
    }
}

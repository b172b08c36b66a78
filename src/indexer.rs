//! Per-container indexing scheduler. Every inventory event for a location
//! cancels that location's pending job and schedules a fresh one after the
//! debounce window, so bursts coalesce and at most one build runs per
//! container at a time. The job itself diffs current contents against the
//! previously indexed rows and drives serializer → cache/provider → vector
//! index → metadata in dependency order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::cache::EmbeddingCache;
use crate::embedding::{EmbeddingProvider, TaskType};
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::item::{BlockPos, ContainerLocations, ItemSnapshot, Location};
use crate::metadata::{path_to_json, ItemRow, MetadataStore};
use crate::serializer::{serialize_snapshots, SerializedItem};
use crate::tags::TagRegistry;

/// Host callback used by radius reindexing to fetch live container contents.
pub trait InventorySource: Send + Sync {
    /// Current contents at `location`, or `None` when the container is not
    /// available (unloaded chunk, destroyed block).
    fn container_snapshot(&self, location: &Location) -> Option<ContainerSnapshot>;
}

pub struct ContainerSnapshot {
    pub locations: ContainerLocations,
    pub container_type: String,
    pub items: Vec<ItemSnapshot>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct LocationKey {
    world: String,
    pos: BlockPos,
}

struct PendingJob {
    generation: u64,
    /// Set once the job passed its debounce and began running; started jobs
    /// are never aborted by a superseding event.
    started: Arc<std::sync::atomic::AtomicBool>,
    handle: JoinHandle<()>,
}

struct Inner {
    metadata: Arc<MetadataStore>,
    cache: Arc<EmbeddingCache>,
    index: Arc<VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    registry: Arc<TagRegistry>,
    debounce: Duration,
    pending: Mutex<HashMap<LocationKey, PendingJob>>,
    run_locks: Mutex<HashMap<LocationKey, Arc<tokio::sync::Mutex<()>>>>,
    generation: AtomicU64,
    active: AtomicUsize,
    jobs_completed: AtomicU64,
}

pub struct ContainerIndexer {
    inner: Arc<Inner>,
}

/// Releases a running job's bookkeeping on completion or cancellation.
struct JobGuard {
    inner: Arc<Inner>,
    key: LocationKey,
    generation: u64,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut pending = self.inner.pending.lock();
        if pending
            .get(&self.key)
            .is_some_and(|job| job.generation == self.generation)
        {
            pending.remove(&self.key);
        }
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ContainerIndexer {
    pub fn new(
        metadata: Arc<MetadataStore>,
        cache: Arc<EmbeddingCache>,
        index: Arc<VectorIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        registry: Arc<TagRegistry>,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                metadata,
                cache,
                index,
                provider,
                registry,
                debounce,
                pending: Mutex::new(HashMap::new()),
                run_locks: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                jobs_completed: AtomicU64::new(0),
            }),
        }
    }

    /// Serialize `items` and debounce an index job for the container at
    /// `locations`. A newer call for the same location supersedes this one.
    pub fn schedule_index(
        &self,
        locations: ContainerLocations,
        container_type: impl Into<String>,
        items: &[ItemSnapshot],
    ) -> Result<()> {
        let serialized = serialize_snapshots(&self.inner.registry, items);
        self.schedule_serialized(locations, container_type.into(), serialized)
    }

    /// Debounce an index job for already-serialized contents.
    pub fn schedule_serialized(
        &self,
        locations: ContainerLocations,
        container_type: String,
        items: Vec<SerializedItem>,
    ) -> Result<()> {
        let Some(primary) = locations.primary() else {
            return Err(Error::InvalidInput(
                "container locations are empty".to_string(),
            ));
        };
        let key = LocationKey {
            world: locations.world.clone(),
            pos: primary,
        };

        let inner = Arc::clone(&self.inner);
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Arc::new(std::sync::atomic::AtomicBool::new(false));

        // Hold the map lock across the spawn so the task's own lookup below
        // cannot run before its entry exists.
        let mut pending = inner.pending.lock();
        if let Some(old) = pending.remove(&key) {
            if !old.started.load(Ordering::SeqCst) {
                old.handle.abort();
            }
        }

        let task_inner = Arc::clone(&inner);
        let task_key = key.clone();
        let task_started = Arc::clone(&started);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(task_inner.debounce).await;

            // Superseded while sleeping? Only the job that still owns the
            // entry may run. `started` and the active counter flip under the
            // same lock the scheduler consults, so a started job is never
            // aborted by a superseding event.
            {
                let pending = task_inner.pending.lock();
                match pending.get(&task_key) {
                    Some(job) if job.generation == generation => {
                        task_started.store(true, Ordering::SeqCst);
                        task_inner.active.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => return,
                }
            }
            // Cleanup must also run if the task is cancelled at an await
            // point (engine shutdown/purge), or drain() would never settle.
            let _cleanup = JobGuard {
                inner: Arc::clone(&task_inner),
                key: task_key.clone(),
                generation,
            };

            let run_lock = task_inner.run_lock_for(&task_key);
            let _guard = run_lock.lock().await;
            if let Err(e) = task_inner
                .index_container(&locations, &container_type, items)
                .await
            {
                tracing::warn!(
                    world = %locations.world,
                    error = %e,
                    "container index job aborted"
                );
            } else {
                task_inner.jobs_completed.fetch_add(1, Ordering::SeqCst);
            }
        });

        pending.insert(
            key,
            PendingJob {
                generation,
                started,
                handle,
            },
        );
        Ok(())
    }

    /// Ask the metadata store for containers within `radius`, apply the
    /// exact distance cut, fetch live contents from the host, and funnel
    /// each through the normal debounce path.
    pub async fn reindex_radius(
        &self,
        center: &Location,
        radius: f64,
        source: &dyn InventorySource,
    ) -> Result<usize> {
        let ids = self
            .inner
            .metadata
            .containers_in_radius(&center.world, center.pos, radius)
            .await?;

        let mut scheduled = 0usize;
        for id in ids {
            let Some(row) = self.inner.metadata.get_container(&id).await? else {
                continue;
            };
            let within = row
                .blocks
                .iter()
                .any(|b| b.distance_sq(&center.pos) <= radius * radius);
            if !within {
                continue;
            }
            let Some(location) = row.primary_location() else {
                continue;
            };
            let Some(snapshot) = source.container_snapshot(&location) else {
                tracing::debug!(container = %id, "container unavailable, skipping reindex");
                continue;
            };
            self.schedule_index(snapshot.locations, snapshot.container_type, &snapshot.items)?;
            scheduled += 1;
        }
        Ok(scheduled)
    }

    /// Wait until every scheduled job has fired and finished.
    pub async fn drain(&self) {
        loop {
            let quiescent =
                self.inner.pending.lock().is_empty() && self.inner.active.load(Ordering::SeqCst) == 0;
            if quiescent {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Cancel every pending (not yet fired) job.
    pub fn abort_pending(&self) {
        let mut pending = self.inner.pending.lock();
        for (_, job) in pending.drain() {
            job.handle.abort();
        }
    }

    pub fn jobs_completed(&self) -> u64 {
        self.inner.jobs_completed.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn run_lock_for(&self, key: &LocationKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.run_locks.lock();
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// The indexing algorithm: resolve container, diff against stored rows,
    /// acquire vectors (cache first, provider for misses), apply.
    async fn index_container(
        &self,
        locations: &ContainerLocations,
        container_type: &str,
        items: Vec<SerializedItem>,
    ) -> Result<()> {
        let cid = self
            .metadata
            .upsert_container(&locations.world, &locations.blocks, container_type)
            .await?;

        let existing: HashMap<(u32, String), ItemRow> = self
            .metadata
            .get_items_by_container(&cid)
            .await?
            .into_iter()
            .map(|row| ((row.slot, path_to_json(&row.container_path)), row))
            .collect();

        let incoming: HashMap<(u32, String), &SerializedItem> = items
            .iter()
            .map(|item| ((item.slot(), path_to_json(item.path())), item))
            .collect();

        // Removed: indexed before, absent now.
        for (key, row) in &existing {
            if !incoming.contains_key(key) {
                self.index.remove(row.ordinal);
                self.metadata.delete_item(row.ordinal).await?;
            }
        }

        // Added, replaced, or orphaned (row exists but its vector is gone).
        let mut pending: Vec<&SerializedItem> = Vec::new();
        for (key, item) in &incoming {
            match existing.get(key) {
                Some(row) if row.fingerprint == item.fingerprint => {
                    if self.index.get(row.ordinal).is_none() {
                        pending.push(item);
                    }
                }
                _ => pending.push(item),
            }
        }
        if pending.is_empty() {
            self.metadata.touch_container(&cid).await?;
            return Ok(());
        }

        let vectors = self.acquire_vectors(&pending).await;

        for item in pending {
            let Some(vector) = vectors.get(&item.fingerprint) else {
                tracing::warn!(
                    material = %item.record.material,
                    slot = item.slot(),
                    "no embedding for item this cycle, skipping"
                );
                continue;
            };
            let ordinal = self
                .metadata
                .upsert_item(
                    &cid,
                    item.slot(),
                    item.path(),
                    item.fingerprint,
                    &item.record.to_bytes(),
                )
                .await?;
            self.index.add(ordinal, vector.clone());
        }

        self.metadata.touch_container(&cid).await
    }

    /// Batched vector acquisition: one cache sweep, one provider batch for
    /// the misses. A failed batch falls back to per-item embedding so a
    /// single bad item only aborts itself.
    async fn acquire_vectors(&self, pending: &[&SerializedItem]) -> HashMap<u64, Vec<f32>> {
        let mut texts_by_fp: HashMap<u64, &str> = HashMap::new();
        for item in pending {
            texts_by_fp
                .entry(item.fingerprint)
                .or_insert(&item.embedding_text);
        }
        let fps: Vec<u64> = texts_by_fp.keys().copied().collect();

        let mut vectors = self.cache.get_all(&fps).await;
        let missing: Vec<u64> = fps
            .iter()
            .copied()
            .filter(|fp| !vectors.contains_key(fp))
            .collect();
        if missing.is_empty() {
            return vectors;
        }

        let texts: Vec<String> = missing
            .iter()
            .map(|fp| texts_by_fp[fp].to_string())
            .collect();
        match self
            .provider
            .embed_batch(&texts, TaskType::RetrievalDocument)
            .await
        {
            Ok(embedded) => {
                for (fp, vector) in missing.iter().zip(embedded) {
                    self.cache.put(*fp, vector.clone());
                    vectors.insert(*fp, vector);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "batch embedding failed, falling back to per-item");
                for (fp, text) in missing.iter().zip(&texts) {
                    match self
                        .provider
                        .embed_one(text, TaskType::RetrievalDocument)
                        .await
                    {
                        Ok(vector) => {
                            self.cache.put(*fp, vector.clone());
                            vectors.insert(*fp, vector);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, text, "embedding unavailable for item");
                        }
                    }
                }
            }
        }
        vectors
    }
}

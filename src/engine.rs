//! Engine facade: owns the long-lived components, wires the index path
//! (indexer → serializer → cache/provider → vector index + metadata) to the
//! query path (search service), and manages startup seeding and shutdown
//! deadlines.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::embedding::{provider_from_config, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::index::{graph::GraphParams, VectorIndex};
use crate::indexer::{ContainerIndexer, InventorySource};
use crate::item::{ContainerLocations, ItemSnapshot, Location};
use crate::metadata::MetadataStore;
use crate::search::{LocationNode, SearchService};
use crate::tags::TagRegistry;

const SHUTDOWN_FLUSH_DEADLINE: Duration = Duration::from_secs(3);
const SHUTDOWN_INDEX_DEADLINE: Duration = Duration::from_secs(5);

/// Host-side permission check. Absent policy ⇒ allow everything.
pub trait AccessPolicy: Send + Sync {
    fn can_access(&self, player_id: &str, location: &Location) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub containers: u64,
    pub items: u64,
    pub cached_embeddings: u64,
    pub indexed_vectors: usize,
    pub index_dirty: bool,
}

pub struct Engine {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    index: Arc<VectorIndex>,
    metadata: Arc<MetadataStore>,
    indexer: ContainerIndexer,
    search: SearchService,
    flusher: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl Engine {
    /// Construct the provider from config, then open everything.
    pub async fn open(config: Config) -> Result<Engine> {
        let provider = provider_from_config(&config.embedding, &config.models_dir()).await?;
        Self::with_provider(config, provider).await
    }

    /// Dependency-injection seam: same wiring with a caller-supplied
    /// provider (embedded hosts, tests).
    pub async fn with_provider(
        config: Config,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Engine> {
        std::fs::create_dir_all(config.db_dir())
            .map_err(|e| Error::InvalidInput(format!("cannot create data dir: {e}")))?;

        let metadata = Arc::new(MetadataStore::open(config.db_dir()).await?);
        let cache = EmbeddingCache::open(
            config.db_dir(),
            provider.dimension(),
            config.cache.clone(),
        )
        .await?;
        let index = Arc::new(VectorIndex::open(
            config.db_dir(),
            GraphParams::from(&config.index),
        ));

        seed_index(&metadata, &cache, &index).await?;

        let flusher = cache.spawn_flusher();

        let registry = Arc::new(TagRegistry::builtin());
        let indexer = ContainerIndexer::new(
            Arc::clone(&metadata),
            Arc::clone(&cache),
            Arc::clone(&index),
            Arc::clone(&provider),
            registry,
            Duration::from_millis(config.index.debounce_ms),
        );
        let search = SearchService::new(
            Arc::clone(&provider),
            Arc::clone(&index),
            Arc::clone(&metadata),
        );

        Ok(Engine {
            provider,
            cache,
            index,
            metadata,
            indexer,
            search,
            flusher: Mutex::new(Some(flusher)),
            shutdown: AtomicBool::new(false),
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShutdownInProgress);
        }
        Ok(())
    }

    // ── Index path ────────────────────────────────────────────────────────

    /// Feed a container snapshot; the job runs after the debounce window.
    pub fn schedule_index(
        &self,
        locations: ContainerLocations,
        container_type: impl Into<String>,
        items: &[ItemSnapshot],
    ) -> Result<()> {
        self.ensure_live()?;
        self.indexer.schedule_index(locations, container_type, items)
    }

    /// Re-index every known container within `radius` of `center`.
    pub async fn reindex_radius(
        &self,
        center: &Location,
        radius: f64,
        source: &dyn InventorySource,
    ) -> Result<usize> {
        self.ensure_live()?;
        self.indexer.reindex_radius(center, radius, source).await
    }

    /// Wait for all scheduled index jobs to finish.
    pub async fn drain(&self) {
        self.indexer.drain().await;
    }

    /// Count of index jobs that ran to completion.
    pub fn jobs_completed(&self) -> u64 {
        self.indexer.jobs_completed()
    }

    // ── Query path ────────────────────────────────────────────────────────

    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<LocationNode>> {
        self.ensure_live()?;
        self.search.search(query, k, None).await
    }

    /// Search restricted to containers `player_id` may open.
    pub async fn search_for_player(
        &self,
        player_id: &str,
        query: &str,
        k: usize,
        policy: Option<&dyn AccessPolicy>,
    ) -> Result<Vec<LocationNode>> {
        self.ensure_live()?;
        let Some(policy) = policy else {
            return self.search.search(query, k, None).await;
        };
        let allowed = self.allowed_ordinals(policy, player_id).await?;
        if allowed.is_empty() {
            return Ok(Vec::new());
        }
        self.search.search(query, k, Some(allowed)).await
    }

    /// Union of item ordinals across containers the player can access.
    pub async fn allowed_ordinals(
        &self,
        policy: &dyn AccessPolicy,
        player_id: &str,
    ) -> Result<HashSet<i64>> {
        let mut allowed = HashSet::new();
        for container in self.metadata.all_containers().await? {
            let Some(location) = container.primary_location() else {
                continue;
            };
            if policy.can_access(player_id, &location) {
                allowed.extend(container.item_ordinals.iter().copied());
            }
        }
        Ok(allowed)
    }

    // ── Maintenance ───────────────────────────────────────────────────────

    pub async fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            containers: self.metadata.count_containers().await?,
            items: self.metadata.count_items().await?,
            cached_embeddings: self.cache.size().await?,
            indexed_vectors: self.index.len(),
            index_dirty: self.index.is_dirty(),
        })
    }

    /// Wipe the stores, the cache, and the on-disk index artifacts.
    pub async fn purge(&self) -> Result<()> {
        self.ensure_live()?;
        self.indexer.abort_pending();
        self.cache.clear().await?;
        self.index.purge_all();
        self.metadata.purge_all().await
    }

    pub fn embedding_dimension(&self) -> usize {
        self.provider.dimension()
    }

    /// Stop accepting work, flush the write buffer (3 s deadline), persist a
    /// dirty index (5 s deadline), then stop background tasks. Remaining
    /// buffered writes past the deadline are lost by design of the cache
    /// tiering; the durable tiers stay consistent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Err(Error::ShutdownInProgress);
        }

        self.indexer.abort_pending();

        if tokio::time::timeout(SHUTDOWN_FLUSH_DEADLINE, self.cache.flush())
            .await
            .is_err()
        {
            tracing::warn!("cache flush missed the shutdown deadline, dropping buffered writes");
        }
        self.cache.stop_flusher();
        if let Some(handle) = self.flusher.lock().take() {
            handle.abort();
        }

        let index = Arc::clone(&self.index);
        let close = tokio::task::spawn_blocking(move || index.shutdown());
        match tokio::time::timeout(SHUTDOWN_INDEX_DEADLINE, close).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "index close failed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "index close task panicked"),
            Err(_) => tracing::warn!("index close missed the shutdown deadline"),
        }
        Ok(())
    }
}

/// Seed the vector index from the metadata rows and the embedding cache.
/// Rows whose vector is no longer cached stay out of the index until the
/// next re-index of their container touches them.
async fn seed_index(
    metadata: &Arc<MetadataStore>,
    cache: &Arc<EmbeddingCache>,
    index: &Arc<VectorIndex>,
) -> Result<()> {
    let pairs = metadata.all_item_fingerprints().await?;
    if pairs.is_empty() {
        index.seed(HashMap::new());
        return Ok(());
    }

    let fps: Vec<u64> = {
        let mut unique: Vec<u64> = pairs.iter().map(|(_, fp)| *fp).collect();
        unique.sort_unstable();
        unique.dedup();
        unique
    };
    let vectors = cache.get_all(&fps).await;

    let mut seeded: HashMap<i64, Vec<f32>> = HashMap::with_capacity(pairs.len());
    let mut orphans = 0usize;
    for (ordinal, fp) in pairs {
        match vectors.get(&fp) {
            Some(v) => {
                seeded.insert(ordinal, v.clone());
            }
            None => orphans += 1,
        }
    }
    if orphans > 0 {
        tracing::warn!(orphans, "item rows without cached vectors, awaiting reindex");
    }
    tracing::info!(vectors = seeded.len(), "vector index seeded");
    index.seed(seeded);
    Ok(())
}

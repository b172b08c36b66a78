//! Approximate-nearest-neighbor index over a sparse ordinal space.
//!
//! The authoritative state is `vector_map` (database ordinal → unit vector).
//! A search graph sits on top, addressed by contiguous internal indices; the
//! `internal_to_db` mapping translates its results back. Any mutation marks
//! the index dirty; the next search rebuilds under the writer lock before
//! running, so readers always observe either the pre-rebuild or the
//! post-rebuild graph, never a partial state.

pub mod graph;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::error::{Error, Result};

use graph::{Graph, GraphParams};

const VECTORS_FILE: &str = "vectors.idx";
const ORDINALS_FILE: &str = "ordinals.map";

/// Search fanout is `min(FANOUT_PER_K * k, N)`.
const FANOUT_PER_K: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub ordinal: i64,
    pub score: f32,
}

#[derive(Default)]
struct IndexState {
    vector_map: HashMap<i64, Vec<f32>>,
    internal_to_db: Vec<i64>,
    db_to_internal: HashMap<i64, u32>,
    graph: Option<Graph>,
    dirty: bool,
}

pub struct VectorIndex {
    state: RwLock<IndexState>,
    params: GraphParams,
    data_dir: PathBuf,
}

impl VectorIndex {
    /// Open the index, loading a previously persisted graph + ordinal
    /// mapping when both parse. `vector_map` starts empty either way and is
    /// re-seeded by the caller from the metadata store.
    pub fn open(data_dir: &Path, params: GraphParams) -> Self {
        let mut state = IndexState::default();

        match load_artifacts(data_dir) {
            Some((graph, ordinals)) if graph.len() == ordinals.len() => {
                state.db_to_internal = ordinals
                    .iter()
                    .enumerate()
                    .map(|(i, &db)| (db, i as u32))
                    .collect();
                state.internal_to_db = ordinals;
                state.graph = Some(graph);
            }
            Some(_) => {
                tracing::warn!("graph/ordinal artifact size mismatch, will rebuild");
                state.dirty = true;
            }
            None => {
                state.dirty = true;
            }
        }

        Self {
            state: RwLock::new(state),
            params,
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Replace `vector_map` wholesale (startup seeding). Leaves the loaded
    /// graph in place when the seeded ordinals match it exactly; otherwise
    /// marks dirty.
    pub fn seed(&self, vectors: HashMap<i64, Vec<f32>>) {
        let mut state = self.state.write();
        let matches_mapping = state.internal_to_db.len() == vectors.len()
            && state.internal_to_db.iter().all(|db| vectors.contains_key(db));
        if !matches_mapping {
            state.dirty = true;
        }
        state.vector_map = vectors;
    }

    pub fn add(&self, ordinal: i64, vector: Vec<f32>) {
        let mut state = self.state.write();
        state.vector_map.insert(ordinal, vector);
        state.dirty = true;
    }

    pub fn remove(&self, ordinal: i64) {
        let mut state = self.state.write();
        if state.vector_map.remove(&ordinal).is_some() {
            state.dirty = true;
        }
    }

    pub fn get(&self, ordinal: i64) -> Option<Vec<f32>> {
        self.state.read().vector_map.get(&ordinal).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().vector_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        self.search_filtered(query, k, None)
    }

    /// Top-k cosine search. With `allowed` set, only those database ordinals
    /// survive; results are sorted by descending score.
    pub fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        allowed: Option<&HashSet<i64>>,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        // Fast path: a clean graph is searched under a shared read lock, so
        // concurrent searches run in parallel.
        {
            let state = self.state.read();
            // No live vectors means no results; skip the rebuild entirely so
            // an empty store never materializes on-disk artifacts.
            if state.vector_map.is_empty() {
                return Ok(Vec::new());
            }
            if !state.dirty && state.graph.is_some() {
                return search_locked(&state, query, k, allowed);
            }
        }

        // Dirty (or never built): rebuild under the writer lock, then
        // downgrade and search the fresh graph. Double-checked, since
        // another writer may have rebuilt while we waited.
        let mut writer = self.state.write();
        if writer.vector_map.is_empty() {
            return Ok(Vec::new());
        }
        if writer.dirty || writer.graph.is_none() {
            rebuild_locked(&mut writer, &self.params, &self.data_dir)?;
        }
        let state = RwLockWriteGuard::downgrade(writer);
        search_locked(&state, query, k, allowed)
    }

    /// Force a rebuild + persist now (normally lazy on search).
    pub fn rebuild(&self) -> Result<()> {
        let mut state = self.state.write();
        rebuild_locked(&mut state, &self.params, &self.data_dir)
    }

    /// Drop all state and delete both on-disk artifacts.
    pub fn purge_all(&self) {
        let mut state = self.state.write();
        *state = IndexState::default();
        let _ = std::fs::remove_file(self.data_dir.join(VECTORS_FILE));
        let _ = std::fs::remove_file(self.data_dir.join(ORDINALS_FILE));
    }

    /// Persist a dirty graph, then close the handle.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.dirty {
            rebuild_locked(&mut state, &self.params, &self.data_dir)?;
        }
        state.graph = None;
        Ok(())
    }
}

/// Run the graph search against a consistent snapshot of the index state.
fn search_locked(
    state: &IndexState,
    query: &[f32],
    k: usize,
    allowed: Option<&HashSet<i64>>,
) -> Result<Vec<SearchHit>> {
    let graph = state
        .graph
        .as_ref()
        .ok_or_else(|| Error::IndexRebuildFailed("graph unavailable".to_string()))?;
    if graph.is_empty() {
        return Ok(Vec::new());
    }
    if query.len() != graph.dim() {
        return Err(Error::InvalidInput(format!(
            "query dimension {} does not match index dimension {}",
            query.len(),
            graph.dim()
        )));
    }

    let fanout = (FANOUT_PER_K * k).min(graph.len()).max(k.min(graph.len()));
    let candidates = graph.search(query, fanout);

    let mut hits = Vec::with_capacity(k);
    for (internal, score) in candidates {
        // Stale candidates: internal index beyond the current mapping, or a
        // vector that has since been removed from the map.
        let Some(&db) = state.internal_to_db.get(internal as usize) else {
            continue;
        };
        if !state.vector_map.contains_key(&db) {
            continue;
        }
        if let Some(allowed) = allowed {
            if !allowed.contains(&db) {
                continue;
            }
        }
        hits.push(SearchHit { ordinal: db, score });
        if hits.len() >= k {
            break;
        }
    }
    Ok(hits)
}

fn load_artifacts(data_dir: &Path) -> Option<(Graph, Vec<i64>)> {
    let vectors_path = data_dir.join(VECTORS_FILE);
    let ordinals_path = data_dir.join(ORDINALS_FILE);
    if !vectors_path.exists() || !ordinals_path.exists() {
        return None;
    }

    let graph = match Graph::read_from(&vectors_path) {
        Ok(g) => g,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load graph artifact");
            return None;
        }
    };
    let text = match std::fs::read_to_string(&ordinals_path) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read ordinal mapping");
            return None;
        }
    };
    let ordinals: std::result::Result<Vec<i64>, _> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().parse::<i64>())
        .collect();
    match ordinals {
        Ok(o) => Some((graph, o)),
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse ordinal mapping");
            None
        }
    }
}

/// Rebuild the graph from `vector_map` (sorted ordinal order) and persist
/// both artifacts. Runs under the writer lock.
fn rebuild_locked(state: &mut IndexState, params: &GraphParams, data_dir: &Path) -> Result<()> {
    let mut ordinals: Vec<i64> = state.vector_map.keys().copied().collect();
    ordinals.sort_unstable();

    let dim = state
        .vector_map
        .values()
        .next()
        .map(Vec::len)
        .unwrap_or(0);
    let rows: Vec<Vec<f32>> = ordinals
        .iter()
        .map(|db| state.vector_map[db].clone())
        .collect();
    if let Some(bad) = rows.iter().find(|r| r.len() != dim) {
        return Err(Error::IndexRebuildFailed(format!(
            "inconsistent vector dimensions ({} vs {dim})",
            bad.len()
        )));
    }

    let graph = Graph::build(&rows, dim, params);

    graph
        .write_to(&data_dir.join(VECTORS_FILE))
        .map_err(|e| Error::IndexRebuildFailed(e.to_string()))?;
    let mapping: String = ordinals
        .iter()
        .map(|db| format!("{db}\n"))
        .collect();
    let tmp = data_dir.join("ordinals.map.tmp");
    std::fs::write(&tmp, mapping)
        .and_then(|()| std::fs::rename(&tmp, data_dir.join(ORDINALS_FILE)))
        .map_err(|e| Error::IndexRebuildFailed(e.to_string()))?;

    state.db_to_internal = ordinals
        .iter()
        .enumerate()
        .map(|(i, &db)| (db, i as u32))
        .collect();
    state.internal_to_db = ordinals;
    state.graph = Some(graph);
    state.dirty = false;
    tracing::debug!(vectors = state.internal_to_db.len(), "vector index rebuilt");
    Ok(())
}

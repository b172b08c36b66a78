//! Single-layer pruned-neighborhood search graph over unit vectors.
//!
//! Construction inserts nodes one at a time: a beam search from the entry
//! point (the medoid) collects candidates, an alpha-pruned subset becomes the
//! node's out-edges, and backlinks are added with overflow pruning once a
//! node exceeds `degree * overflow`. No hierarchy; the entry point is the
//! only way in. Scores are dot products, which equal cosine similarity for
//! the unit vectors this index stores.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Context};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rayon::prelude::*;

const MAGIC: &[u8; 4] = b"LLIX";
const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy)]
pub struct GraphParams {
    /// Target out-degree per node.
    pub degree: usize,
    /// Beam width during construction.
    pub build_beam: usize,
    /// A node may accumulate `degree * overflow` backlinks before re-pruning.
    pub overflow: f32,
    /// Pruning aggressiveness; larger keeps longer-range edges.
    pub alpha: f32,
}

impl Default for GraphParams {
    fn default() -> Self {
        Self {
            degree: 16,
            build_beam: 100,
            overflow: 1.2,
            alpha: 1.2,
        }
    }
}

impl From<&crate::config::IndexConfig> for GraphParams {
    fn from(cfg: &crate::config::IndexConfig) -> Self {
        Self {
            degree: cfg.graph_degree.max(2),
            build_beam: cfg.construction_depth.max(8),
            overflow: cfg.overflow_factor.max(1.0),
            alpha: cfg.alpha.max(1.0),
        }
    }
}

/// Immutable search graph. Node ids are internal indices `[0..len)`; mapping
/// them to database ordinals is the owner's concern.
pub struct Graph {
    dim: usize,
    entry: u32,
    neighbors: Vec<Vec<u32>>,
    /// Flat row-major vector storage, `len * dim`.
    vectors: Vec<f32>,
}

#[derive(Clone, Copy, PartialEq)]
struct Scored {
    idx: u32,
    score: f32,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl Graph {
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn vector(&self, idx: u32) -> &[f32] {
        let start = idx as usize * self.dim;
        &self.vectors[start..start + self.dim]
    }

    // ── Construction ──────────────────────────────────────────────────────

    /// Build from vectors in internal-index order. Every vector must have
    /// length `dim`.
    pub fn build(rows: &[Vec<f32>], dim: usize, params: &GraphParams) -> Graph {
        let n = rows.len();
        let mut vectors = Vec::with_capacity(n * dim);
        for row in rows {
            debug_assert_eq!(row.len(), dim);
            vectors.extend_from_slice(row);
        }

        let mut graph = Graph {
            dim,
            entry: 0,
            neighbors: vec![Vec::new(); n],
            vectors,
        };
        if n == 0 {
            return graph;
        }

        graph.entry = graph.medoid();
        let max_links = ((params.degree as f32) * params.overflow).ceil() as usize;

        for i in 0..n as u32 {
            let visited = graph
                .beam_search(graph.vector_owned(i).as_slice(), params.build_beam)
                .visited;
            let pruned = graph.robust_prune(i, visited, params);
            graph.neighbors[i as usize] = pruned.clone();

            for j in pruned {
                if !graph.neighbors[j as usize].contains(&i) {
                    graph.neighbors[j as usize].push(i);
                }
                if graph.neighbors[j as usize].len() > max_links {
                    let candidates: Vec<Scored> = graph.neighbors[j as usize]
                        .iter()
                        .map(|&k| Scored {
                            idx: k,
                            score: dot(graph.vector(j), graph.vector(k)),
                        })
                        .collect();
                    graph.neighbors[j as usize] = graph.robust_prune(j, candidates, params);
                }
            }
        }
        graph
    }

    fn vector_owned(&self, idx: u32) -> Vec<f32> {
        self.vector(idx).to_vec()
    }

    /// Node closest (by dot product) to the centroid.
    fn medoid(&self) -> u32 {
        let n = self.len();
        if n <= 1 {
            return 0;
        }
        let mut centroid = vec![0.0f32; self.dim];
        for i in 0..n as u32 {
            for (c, x) in centroid.iter_mut().zip(self.vector(i)) {
                *c += x;
            }
        }
        let inv = 1.0 / n as f32;
        for c in &mut centroid {
            *c *= inv;
        }

        (0..n as u32)
            .into_par_iter()
            .map(|i| Scored {
                idx: i,
                score: dot(&centroid, self.vector(i)),
            })
            .max()
            .map(|s| s.idx)
            .unwrap_or(0)
    }

    /// Alpha-prune `candidates` down to at most `degree` diverse neighbors
    /// of `node`. Candidates carry similarity scores to `node`'s vector.
    fn robust_prune(&self, node: u32, mut candidates: Vec<Scored>, params: &GraphParams) -> Vec<u32> {
        candidates.retain(|c| c.idx != node);

        // Work in distance space (1 - similarity) for the alpha rule.
        let mut pool: Vec<(u32, f32)> = candidates
            .into_iter()
            .map(|c| (c.idx, 1.0 - c.score))
            .collect();
        pool.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let mut result: Vec<u32> = Vec::with_capacity(params.degree);
        while !pool.is_empty() && result.len() < params.degree {
            let (best, _) = pool.remove(0);
            result.push(best);
            let best_vec = self.vector(best).to_vec();
            // Drop candidates the chosen neighbor already covers.
            pool.retain(|&(idx, dist_to_node)| {
                let d_best = 1.0 - dot(&best_vec, self.vector(idx));
                d_best * params.alpha > dist_to_node
            });
        }
        result
    }

    // ── Search ────────────────────────────────────────────────────────────

    /// Best-first beam search from the entry point. Returns up to `beam`
    /// results sorted by descending similarity.
    pub fn search(&self, query: &[f32], beam: usize) -> Vec<(u32, f32)> {
        self.beam_search(query, beam).best
    }

    fn beam_search(&self, query: &[f32], beam: usize) -> BeamResult {
        let mut result = BeamResult::default();
        if self.is_empty() || beam == 0 {
            return result;
        }

        let mut visited: HashSet<u32> = HashSet::new();
        let mut frontier: BinaryHeap<Scored> = BinaryHeap::new();
        // Min-heap of the best `beam` nodes seen so far.
        let mut best: BinaryHeap<std::cmp::Reverse<Scored>> = BinaryHeap::new();

        let entry_scored = Scored {
            idx: self.entry,
            score: dot(query, self.vector(self.entry)),
        };
        visited.insert(self.entry);
        frontier.push(entry_scored);
        best.push(std::cmp::Reverse(entry_scored));
        result.visited.push(entry_scored);

        while let Some(current) = frontier.pop() {
            let worst_of_best = best.peek().map(|r| r.0.score).unwrap_or(f32::NEG_INFINITY);
            if best.len() >= beam && current.score < worst_of_best {
                break;
            }
            for &nb in &self.neighbors[current.idx as usize] {
                if !visited.insert(nb) {
                    continue;
                }
                let scored = Scored {
                    idx: nb,
                    score: dot(query, self.vector(nb)),
                };
                result.visited.push(scored);
                let worst = best.peek().map(|r| r.0.score).unwrap_or(f32::NEG_INFINITY);
                if best.len() < beam || scored.score > worst {
                    frontier.push(scored);
                    best.push(std::cmp::Reverse(scored));
                    if best.len() > beam {
                        best.pop();
                    }
                }
            }
        }

        let mut out: Vec<(u32, f32)> = best.into_iter().map(|r| (r.0.idx, r.0.score)).collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        result.best = out;
        result
    }

    // ── Persistence ───────────────────────────────────────────────────────

    /// Serialize to `path` via a temp file + rename; the final bytes carry
    /// an xxh3 trailer checked on load.
    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        let mut buf: Vec<u8> = Vec::new();
        buf.write_all(MAGIC)?;
        buf.write_u8(VERSION)?;
        buf.write_u32::<LittleEndian>(self.dim as u32)?;
        buf.write_u32::<LittleEndian>(self.len() as u32)?;
        buf.write_u32::<LittleEndian>(self.entry)?;
        for links in &self.neighbors {
            buf.write_u16::<LittleEndian>(links.len() as u16)?;
            for &l in links {
                buf.write_u32::<LittleEndian>(l)?;
            }
        }
        for &x in &self.vectors {
            buf.write_f32::<LittleEndian>(x)?;
        }
        let checksum = xxhash_rust::xxh3::xxh3_64(&buf);
        buf.write_u64::<LittleEndian>(checksum)?;

        let tmp = path.with_extension("idx.tmp");
        std::fs::write(&tmp, &buf)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to move graph into {}", path.display()))?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> anyhow::Result<Graph> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if bytes.len() < MAGIC.len() + 1 + 12 + 8 {
            bail!("graph file truncated");
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 8);
        let stored = (&mut &trailer[..]).read_u64::<LittleEndian>()?;
        if xxhash_rust::xxh3::xxh3_64(body) != stored {
            bail!("graph file checksum mismatch");
        }

        let mut r = body;
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            bail!("not a graph file");
        }
        if r.read_u8()? != VERSION {
            bail!("unsupported graph version");
        }
        let dim = r.read_u32::<LittleEndian>()? as usize;
        let count = r.read_u32::<LittleEndian>()? as usize;
        let entry = r.read_u32::<LittleEndian>()?;

        let mut neighbors = Vec::with_capacity(count);
        for _ in 0..count {
            let links = r.read_u16::<LittleEndian>()? as usize;
            let mut list = Vec::with_capacity(links);
            for _ in 0..links {
                list.push(r.read_u32::<LittleEndian>()?);
            }
            neighbors.push(list);
        }
        let mut vectors = vec![0.0f32; count * dim];
        for x in &mut vectors {
            *x = r.read_f32::<LittleEndian>()?;
        }
        if count > 0 && entry as usize >= count {
            bail!("graph entry point out of range");
        }

        Ok(Graph {
            dim,
            entry,
            neighbors,
            vectors,
        })
    }
}

#[derive(Default)]
struct BeamResult {
    best: Vec<(u32, f32)>,
    visited: Vec<Scored>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(v: Vec<f32>) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.into_iter().map(|x| x / norm).collect()
    }

    /// Deterministic pseudo-random unit vectors (no RNG dependency here).
    fn synthetic_vectors(n: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let mut v: Vec<f32> = (0..dim)
                    .map(|d| {
                        let h = xxhash_rust::xxh3::xxh3_64(&[(i as u8), (d as u8), 7]);
                        (h % 2000) as f32 / 1000.0 - 1.0
                    })
                    .collect();
                if v.iter().all(|x| *x == 0.0) {
                    v[0] = 1.0;
                }
                unit(v)
            })
            .collect()
    }

    fn brute_force_top_k(rows: &[Vec<f32>], query: &[f32], k: usize) -> Vec<u32> {
        let mut scored: Vec<(u32, f32)> = rows
            .iter()
            .enumerate()
            .map(|(i, v)| (i as u32, dot(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        scored.truncate(k);
        scored.into_iter().map(|(i, _)| i).collect()
    }

    #[test]
    fn empty_graph_searches_empty() {
        let g = Graph::build(&[], 4, &GraphParams::default());
        assert!(g.is_empty());
        assert!(g.search(&[1.0, 0.0, 0.0, 0.0], 10).is_empty());
    }

    #[test]
    fn single_node_graph() {
        let g = Graph::build(&[unit(vec![1.0, 1.0])], 2, &GraphParams::default());
        let hits = g.search(&unit(vec![1.0, 0.9]), 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 0);
        assert!(hits[0].1 > 0.9);
    }

    #[test]
    fn beam_covering_all_nodes_matches_brute_force() {
        let rows = synthetic_vectors(60, 8);
        let g = Graph::build(&rows, 8, &GraphParams::default());
        let query = unit(vec![0.3, -0.2, 0.9, 0.1, 0.0, 0.5, -0.4, 0.2]);

        let got: Vec<u32> = g.search(&query, 60).iter().map(|(i, _)| *i).take(5).collect();
        let expected = brute_force_top_k(&rows, &query, 5);
        assert_eq!(got, expected);
    }

    #[test]
    fn scores_are_non_increasing() {
        let rows = synthetic_vectors(40, 6);
        let g = Graph::build(&rows, 6, &GraphParams::default());
        let hits = g.search(&rows[3], 20);
        for pair in hits.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
        // The query vector itself must be the top hit.
        assert_eq!(hits[0].0, 3);
    }

    #[test]
    fn degree_bound_holds_after_build() {
        let params = GraphParams::default();
        let rows = synthetic_vectors(200, 8);
        let g = Graph::build(&rows, 8, &params);
        let max_links = ((params.degree as f32) * params.overflow).ceil() as usize;
        for links in &g.neighbors {
            assert!(links.len() <= max_links, "degree overflow: {}", links.len());
        }
    }

    #[test]
    fn codec_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.idx");
        let rows = synthetic_vectors(25, 4);
        let g = Graph::build(&rows, 4, &GraphParams::default());
        g.write_to(&path).unwrap();

        let loaded = Graph::read_from(&path).unwrap();
        assert_eq!(loaded.dim, g.dim);
        assert_eq!(loaded.entry, g.entry);
        assert_eq!(loaded.neighbors, g.neighbors);
        assert_eq!(loaded.vectors, g.vectors);
    }

    #[test]
    fn corrupted_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.idx");
        let rows = synthetic_vectors(10, 4);
        Graph::build(&rows, 4, &GraphParams::default())
            .write_to(&path)
            .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(Graph::read_from(&path).is_err());
    }
}

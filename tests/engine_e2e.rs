//! End-to-end scenarios over the engine facade with a deterministic
//! embedding provider, plus the concurrent rebuild-under-search stress run
//! against the vector index itself.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::test_engine;
use lootlens::index::graph::GraphParams;
use lootlens::index::VectorIndex;
use lootlens::search::ResultNode;
use lootlens::{AccessPolicy, ContainerLocations, ItemSnapshot, Location};

fn chest(world: &str, x: i32, y: i32, z: i32) -> ContainerLocations {
    ContainerLocations::single(world, x, y, z)
}

// ── Scenario 1: empty index ───────────────────────────────────────────────

#[tokio::test]
async fn empty_store_answers_empty() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, provider) = test_engine(dir.path()).await;

    let results = engine.search("diamond", 10).await.unwrap();
    assert!(results.is_empty());
    // Only the query itself was embedded; nothing was indexed.
    assert_eq!(provider.texts_embedded.load(Ordering::SeqCst), 1);
    // No index artifacts materialize for an empty store.
    assert!(!dir.path().join("vectors.idx").exists());
    assert!(!dir.path().join("ordinals.map").exists());

    engine.shutdown().await.unwrap();
}

// ── Scenario 2: single chest, two items ───────────────────────────────────

#[tokio::test]
async fn weapon_query_ranks_sword_over_bread() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _provider) = test_engine(dir.path()).await;

    let items = vec![
        ItemSnapshot::new("DIAMOND_SWORD").with_enchantment("sharpness", 5),
        ItemSnapshot::new("BREAD").with_amount(3),
    ];
    engine
        .schedule_index(chest("w0", 10, 64, 10), "chest", &items)
        .unwrap();
    engine.drain().await;

    let results = engine.search("weapon", 5).await.unwrap();
    assert_eq!(results.len(), 1);
    let location = &results[0];
    assert_eq!(location.world, "w0");
    assert_eq!(location.pos, lootlens::BlockPos::new(10, 64, 10));

    let ResultNode::Item(first) = &location.nodes[0] else {
        panic!("expected an item hit first");
    };
    assert_eq!(first.record.material, "DIAMOND_SWORD");
    for node in &location.nodes[1..] {
        if let ResultNode::Item(other) = node {
            assert!(first.score_percent >= other.score_percent);
        }
    }

    // The reverse query lands on the bread.
    let food = engine.search("food", 1).await.unwrap();
    let ResultNode::Item(hit) = &food[0].nodes[0] else {
        panic!("expected an item hit");
    };
    assert_eq!(hit.record.material, "BREAD");

    engine.shutdown().await.unwrap();
}

// ── Scenario 3: nested shulker ────────────────────────────────────────────

#[tokio::test]
async fn nested_shulker_reports_path_and_tree() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _provider) = test_engine(dir.path()).await;

    let mut items = vec![
        ItemSnapshot::new("AIR"),
        ItemSnapshot::new("AIR"),
        ItemSnapshot::new("AIR"),
        ItemSnapshot::new("AIR"),
        ItemSnapshot::new("AIR"),
    ];
    items.push(
        ItemSnapshot::new("RED_SHULKER_BOX")
            .with_container("shulker_box", vec![ItemSnapshot::new("EMERALD")]),
    );
    engine
        .schedule_index(chest("w0", 0, 64, 0), "chest", &items)
        .unwrap();
    engine.drain().await;

    let results = engine.search("emerald", 1).await.unwrap();
    assert_eq!(results.len(), 1);
    let location = &results[0];
    assert_eq!(location.nodes.len(), 1);

    let ResultNode::Container(shulker) = &location.nodes[0] else {
        panic!("expected a container node");
    };
    assert_eq!(shulker.container_type, "shulker_box");
    assert_eq!(shulker.color.as_deref(), Some("red"));
    assert_eq!(shulker.slot, 5);
    assert_eq!(shulker.children.len(), 1);

    let ResultNode::Item(leaf) = &shulker.children[0] else {
        panic!("expected an item leaf");
    };
    assert_eq!(leaf.record.material, "EMERALD");
    let path = leaf.record.container_path.as_ref().unwrap();
    assert_eq!(path.len(), 1);
    assert_eq!(path[0].container_type, "shulker_box");
    assert_eq!(path[0].color.as_deref(), Some("red"));
    assert_eq!(path[0].parent_slot, 5);

    engine.shutdown().await.unwrap();
}

// ── Scenario 4: diff churn under debounce ─────────────────────────────────

#[tokio::test]
async fn burst_updates_coalesce_to_last_state() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _provider) = test_engine(dir.path()).await;

    for material in ["BREAD", "STONE", "EMERALD"] {
        engine
            .schedule_index(chest("w0", 1, 64, 1), "chest", &[ItemSnapshot::new(material)])
            .unwrap();
    }
    engine.drain().await;

    assert_eq!(engine.jobs_completed(), 1, "burst coalesced to one job");
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.items, 1);
    assert_eq!(stats.indexed_vectors, 1, "one ordinal for slot 0");

    let results = engine.search("emerald", 5).await.unwrap();
    let ResultNode::Item(hit) = &results[0].nodes[0] else {
        panic!("expected an item hit");
    };
    assert_eq!(hit.record.material, "EMERALD");
    assert_eq!(hit.slot, 0);

    engine.shutdown().await.unwrap();
}

// ── Scenario 5: cache reuse across containers ─────────────────────────────

#[tokio::test]
async fn identical_items_share_one_embedding() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, provider) = test_engine(dir.path()).await;

    engine
        .schedule_index(chest("w0", 0, 64, 0), "chest", &[ItemSnapshot::new("IRON_PICKAXE")])
        .unwrap();
    engine.drain().await;
    engine
        .schedule_index(chest("w0", 50, 64, 0), "chest", &[ItemSnapshot::new("IRON_PICKAXE")])
        .unwrap();
    engine.drain().await;

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.containers, 2);
    assert_eq!(stats.items, 2);
    assert_eq!(
        provider.texts_embedded.load(Ordering::SeqCst),
        1,
        "second job is served from the embedding cache"
    );
    assert_eq!(
        provider.batch_calls.load(Ordering::SeqCst),
        1,
        "the cache hit avoids a second provider round-trip"
    );

    engine.shutdown().await.unwrap();
}

// ── Persistence across restart ────────────────────────────────────────────

#[tokio::test]
async fn restart_seeds_index_from_cache_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let provider = {
        let (engine, provider) = test_engine(dir.path()).await;
        engine
            .schedule_index(
                chest("w0", 0, 64, 0),
                "chest",
                &[ItemSnapshot::new("DIAMOND_SWORD").with_enchantment("sharpness", 5)],
            )
            .unwrap();
        engine.drain().await;
        // Force a hit before shutdown so artifacts are persisted.
        assert!(!engine.search("sword", 3).await.unwrap().is_empty());
        engine.shutdown().await.unwrap();
        provider
    };
    let embedded_before = provider.texts_embedded.load(Ordering::SeqCst);

    // Same provider instance (same vocabulary), fresh engine over the same
    // data dir: rows + cached vectors seed the index without re-embedding.
    let mut config = lootlens::Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.index.debounce_ms = 40;
    let engine = lootlens::Engine::with_provider(config, Arc::clone(&provider) as _)
        .await
        .unwrap();

    let results = engine.search("sword", 3).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        provider.texts_embedded.load(Ordering::SeqCst),
        embedded_before + 1,
        "restart embeds only the new query"
    );

    engine.shutdown().await.unwrap();
}

// ── Access policy filter ──────────────────────────────────────────────────

struct WorldPolicy {
    allowed_world: &'static str,
}

impl AccessPolicy for WorldPolicy {
    fn can_access(&self, _player: &str, location: &Location) -> bool {
        location.world == self.allowed_world
    }
}

#[tokio::test]
async fn player_search_respects_access_policy() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _provider) = test_engine(dir.path()).await;

    engine
        .schedule_index(chest("overworld", 0, 64, 0), "chest", &[ItemSnapshot::new("BREAD")])
        .unwrap();
    engine
        .schedule_index(chest("nether", 0, 64, 0), "chest", &[ItemSnapshot::new("BREAD")])
        .unwrap();
    engine.drain().await;

    let open = engine.search("bread", 10).await.unwrap();
    assert_eq!(open.len(), 2);

    let policy = WorldPolicy {
        allowed_world: "overworld",
    };
    let filtered = engine
        .search_for_player("steve", "bread", 10, Some(&policy))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].world, "overworld");

    let none = engine
        .search_for_player(
            "steve",
            "bread",
            10,
            Some(&WorldPolicy {
                allowed_world: "end",
            }),
        )
        .await
        .unwrap();
    assert!(none.is_empty());

    engine.shutdown().await.unwrap();
}

// ── Scenario 6: rebuild under concurrent search ───────────────────────────

#[test]
fn rebuild_under_concurrent_search() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const DIM: usize = 8;
    const TOTAL: i64 = 1000;
    const REMOVED: i64 = 200;

    fn random_unit(rng: &mut StdRng) -> Vec<f32> {
        let mut v: Vec<f32> = (0..DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        } else {
            v[0] = 1.0;
        }
        v
    }

    let dir = tempfile::tempdir().unwrap();
    // Small graph parameters keep the repeated rebuilds cheap.
    let params = GraphParams {
        degree: 8,
        build_beam: 16,
        overflow: 1.2,
        alpha: 1.2,
    };
    let index = Arc::new(VectorIndex::open(dir.path(), params));

    let mut rng = StdRng::seed_from_u64(42);
    for ordinal in 0..TOTAL {
        index.add(ordinal, random_unit(&mut rng));
    }
    index.rebuild().unwrap();

    let remover = {
        let index = Arc::clone(&index);
        std::thread::spawn(move || {
            for ordinal in 0..REMOVED {
                index.remove(ordinal);
            }
        })
    };

    let searchers: Vec<_> = (0..100)
        .map(|seed| {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(1000 + seed);
                let query = random_unit(&mut rng);
                let hits = index.search(&query, 10).expect("search");
                assert!(hits.len() <= 10);
                for pair in hits.windows(2) {
                    assert!(pair[0].score >= pair[1].score);
                }
                for hit in &hits {
                    assert!((0..TOTAL).contains(&hit.ordinal));
                    // Live at return time: the search filtered against
                    // vector_map under its read guard, so a hit may only
                    // disappear afterwards, at the remover's hand.
                    if hit.ordinal >= REMOVED {
                        assert!(index.get(hit.ordinal).is_some());
                    }
                }
            })
        })
        .collect();

    remover.join().unwrap();
    for searcher in searchers {
        searcher.join().unwrap();
    }

    // Quiesced: no removed ordinal may surface again.
    let mut rng = StdRng::seed_from_u64(7);
    let hits = index.search(&random_unit(&mut rng), 50).unwrap();
    assert!(hits.iter().all(|h| h.ordinal >= REMOVED));
    assert_eq!(index.len(), (TOTAL - REMOVED) as usize);
}

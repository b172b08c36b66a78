//! Query path: embed the query, run the (optionally filtered) vector
//! search, hydrate metadata rows, and reconstruct the location →
//! nested-container → item hierarchy from the flat hits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::embedding::{EmbeddingProvider, TaskType};
use crate::error::{Error, Result};
use crate::index::{SearchHit, VectorIndex};
use crate::item::{BlockPos, ContainerRef};
use crate::metadata::{ContainerRow, ItemRow, MetadataStore};
use crate::serializer::StorageRecord;

#[derive(Debug, Clone)]
pub struct ItemHit {
    pub ordinal: i64,
    pub slot: u32,
    pub score_percent: u8,
    pub record: StorageRecord,
}

#[derive(Debug, Clone)]
pub struct ContainerNode {
    pub container_type: String,
    pub color: Option<String>,
    pub custom_name: Option<String>,
    pub slot: u32,
    /// Present when the container itself was a hit in this result set.
    pub score_percent: Option<u8>,
    pub children: Vec<ResultNode>,
}

#[derive(Debug, Clone)]
pub enum ResultNode {
    Container(ContainerNode),
    Item(ItemHit),
}

/// One physical container location holding at least one hit.
#[derive(Debug, Clone)]
pub struct LocationNode {
    pub world: String,
    pub pos: BlockPos,
    pub container_type: String,
    pub nodes: Vec<ResultNode>,
}

pub struct SearchService {
    provider: Arc<dyn EmbeddingProvider>,
    index: Arc<VectorIndex>,
    metadata: Arc<MetadataStore>,
}

impl SearchService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        index: Arc<VectorIndex>,
        metadata: Arc<MetadataStore>,
    ) -> Self {
        Self {
            provider,
            index,
            metadata,
        }
    }

    /// Top-k semantic search, grouped by container location. `filter`
    /// restricts results to the given ordinals (access control).
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<HashSet<i64>>,
    ) -> Result<Vec<LocationNode>> {
        if query.trim().is_empty() {
            return Err(Error::InvalidInput("empty query".to_string()));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let qv = self
            .provider
            .embed_one(query, TaskType::RetrievalQuery)
            .await?;

        let index = Arc::clone(&self.index);
        let hits = tokio::task::spawn_blocking(move || {
            index.search_filtered(&qv, k, filter.as_ref())
        })
        .await
        .map_err(|e| Error::IndexRebuildFailed(e.to_string()))??;

        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ordinals: Vec<i64> = hits.iter().map(|h| h.ordinal).collect();
        let rows = self.metadata.get_rows(&ordinals).await?;

        let mut containers: HashMap<String, ContainerRow> = HashMap::new();
        for row in rows.values() {
            if !containers.contains_key(&row.container_id) {
                if let Some(container) = self.metadata.get_container(&row.container_id).await? {
                    containers.insert(row.container_id.clone(), container);
                }
            }
        }

        Ok(build_location_nodes(&hits, &rows, &containers))
    }
}

/// Group flat hits by container location (hit order preserved) and rebuild
/// each group's nested-container tree.
pub(crate) fn build_location_nodes(
    hits: &[SearchHit],
    rows: &HashMap<i64, ItemRow>,
    containers: &HashMap<String, ContainerRow>,
) -> Vec<LocationNode> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<(&SearchHit, &ItemRow)>> = HashMap::new();
    for hit in hits {
        let Some(row) = rows.get(&hit.ordinal) else {
            // The row vanished between search and hydration; drop the hit.
            continue;
        };
        if !containers.contains_key(&row.container_id) {
            continue;
        }
        if !grouped.contains_key(&row.container_id) {
            order.push(row.container_id.clone());
        }
        grouped.entry(row.container_id.clone()).or_default().push((hit, row));
    }

    let mut out = Vec::with_capacity(order.len());
    for container_id in order {
        let container = &containers[&container_id];
        let Some(location) = container.primary_location() else {
            continue;
        };

        let mut nodes: Vec<ResultNode> = Vec::new();
        let mut root_container_hits: Vec<ItemHit> = Vec::new();

        for (hit, row) in &grouped[&container_id] {
            let Some(record) = StorageRecord::from_bytes(&row.storage_record) else {
                continue;
            };
            let item_hit = ItemHit {
                ordinal: row.ordinal,
                slot: row.slot,
                score_percent: score_percent(hit.score),
                record,
            };
            if row.container_path.is_empty() && holds_items(&item_hit.record) {
                // Decide later whether this becomes a container node score
                // or a plain leaf, once all children are placed.
                root_container_hits.push(item_hit);
            } else {
                insert_hit(&mut nodes, &row.container_path, item_hit);
            }
        }

        for item_hit in root_container_hits {
            let hit_type = crate::serializer::material_container_type(&item_hit.record.material);
            let merged = nodes.iter_mut().find_map(|n| match n {
                ResultNode::Container(c)
                    if c.slot == item_hit.slot && c.container_type == hit_type =>
                {
                    Some(c)
                }
                _ => None,
            });
            match merged {
                Some(container_node) => {
                    container_node.score_percent = Some(item_hit.score_percent);
                    if container_node.custom_name.is_none() {
                        container_node.custom_name = item_hit.record.custom_name.clone();
                    }
                }
                None => nodes.push(ResultNode::Item(item_hit)),
            }
        }

        out.push(LocationNode {
            world: location.world,
            pos: location.pos,
            container_type: container.container_type.clone(),
            nodes,
        });
    }
    out
}

fn score_percent(score: f32) -> u8 {
    (score * 100.0).round().clamp(0.0, 100.0) as u8
}

fn holds_items(record: &StorageRecord) -> bool {
    let t = crate::serializer::material_container_type(&record.material);
    matches!(t.as_str(), "shulker_box" | "bundle" | "chest" | "barrel")
}

/// Walk the container path, creating nested container nodes on demand
/// (deduplicated by `(type, slot)` per level), and attach the leaf at the
/// deepest container.
fn insert_hit(children: &mut Vec<ResultNode>, path: &[ContainerRef], hit: ItemHit) {
    let Some(segment) = path.first() else {
        children.push(ResultNode::Item(hit));
        return;
    };

    let existing = children.iter().position(|n| {
        matches!(n, ResultNode::Container(c)
            if c.container_type == segment.container_type && c.slot == segment.parent_slot)
    });
    let idx = match existing {
        Some(i) => i,
        None => {
            children.push(ResultNode::Container(ContainerNode {
                container_type: segment.container_type.clone(),
                color: segment.color.clone(),
                custom_name: segment.custom_name.clone(),
                slot: segment.parent_slot,
                score_percent: None,
                children: Vec::new(),
            }));
            children.len() - 1
        }
    };
    if let ResultNode::Container(container) = &mut children[idx] {
        insert_hit(&mut container.children, &path[1..], hit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_bytes(material: &str, slot: u32, path: Vec<ContainerRef>) -> Vec<u8> {
        StorageRecord {
            name: crate::item::format_material_name(material),
            material: material.to_string(),
            amount: 1,
            slot,
            display_name: None,
            custom_name: None,
            lore: vec![],
            enchantments: vec![],
            durability: None,
            rarity: None,
            category: None,
            material_type: crate::serializer::MaterialType::Item,
            unbreakable: None,
            container_path: if path.is_empty() { None } else { Some(path) },
        }
        .to_bytes()
    }

    fn item_row(ordinal: i64, container_id: &str, material: &str, slot: u32, path: Vec<ContainerRef>) -> ItemRow {
        let bytes = record_bytes(material, slot, path.clone());
        ItemRow {
            ordinal,
            container_id: container_id.to_string(),
            slot,
            container_path: path,
            fingerprint: 0,
            storage_record: bytes,
            indexed_at: 0,
        }
    }

    fn chest_row(container_id: &str) -> ContainerRow {
        ContainerRow {
            container_id: container_id.to_string(),
            world: "w0".to_string(),
            container_type: "chest".to_string(),
            blocks: vec![BlockPos::new(0, 64, 0)],
            last_indexed_at: 0,
            item_ordinals: vec![],
        }
    }

    fn shulker_ref(slot: u32) -> ContainerRef {
        ContainerRef {
            container_type: "shulker_box".to_string(),
            color: Some("red".to_string()),
            custom_name: None,
            parent_slot: slot,
        }
    }

    #[test]
    fn nested_hit_builds_container_chain() {
        let rows: HashMap<i64, ItemRow> = [(
            1i64,
            item_row(1, "c1", "EMERALD", 0, vec![shulker_ref(5)]),
        )]
        .into_iter()
        .collect();
        let containers: HashMap<String, ContainerRow> =
            [("c1".to_string(), chest_row("c1"))].into_iter().collect();
        let hits = vec![SearchHit {
            ordinal: 1,
            score: 0.93,
        }];

        let tree = build_location_nodes(&hits, &rows, &containers);
        assert_eq!(tree.len(), 1);
        let location = &tree[0];
        assert_eq!(location.world, "w0");
        assert_eq!(location.nodes.len(), 1);
        let ResultNode::Container(shulker) = &location.nodes[0] else {
            panic!("expected container node");
        };
        assert_eq!(shulker.container_type, "shulker_box");
        assert_eq!(shulker.color.as_deref(), Some("red"));
        assert_eq!(shulker.slot, 5);
        assert_eq!(shulker.children.len(), 1);
        let ResultNode::Item(leaf) = &shulker.children[0] else {
            panic!("expected item leaf");
        };
        assert_eq!(leaf.record.material, "EMERALD");
        assert_eq!(leaf.score_percent, 93);
    }

    #[test]
    fn container_hit_with_children_carries_score_on_the_node() {
        let rows: HashMap<i64, ItemRow> = [
            (1i64, item_row(1, "c1", "EMERALD", 0, vec![shulker_ref(5)])),
            (2i64, item_row(2, "c1", "RED_SHULKER_BOX", 5, vec![])),
        ]
        .into_iter()
        .collect();
        let containers: HashMap<String, ContainerRow> =
            [("c1".to_string(), chest_row("c1"))].into_iter().collect();
        let hits = vec![
            SearchHit { ordinal: 2, score: 0.8 },
            SearchHit { ordinal: 1, score: 0.7 },
        ];

        let tree = build_location_nodes(&hits, &rows, &containers);
        assert_eq!(tree.len(), 1);
        // One node: the shulker, carrying its own score plus the leaf.
        assert_eq!(tree[0].nodes.len(), 1);
        let ResultNode::Container(shulker) = &tree[0].nodes[0] else {
            panic!("expected container node");
        };
        assert_eq!(shulker.score_percent, Some(80));
        assert_eq!(shulker.children.len(), 1);
    }

    #[test]
    fn lone_container_hit_stays_a_leaf() {
        let rows: HashMap<i64, ItemRow> =
            [(2i64, item_row(2, "c1", "RED_SHULKER_BOX", 5, vec![]))]
                .into_iter()
                .collect();
        let containers: HashMap<String, ContainerRow> =
            [("c1".to_string(), chest_row("c1"))].into_iter().collect();
        let hits = vec![SearchHit { ordinal: 2, score: 0.8 }];

        let tree = build_location_nodes(&hits, &rows, &containers);
        assert_eq!(tree[0].nodes.len(), 1);
        assert!(matches!(tree[0].nodes[0], ResultNode::Item(_)));
    }

    #[test]
    fn groups_preserve_hit_order_across_locations() {
        let mut second = chest_row("c2");
        second.blocks = vec![BlockPos::new(100, 64, 0)];
        let rows: HashMap<i64, ItemRow> = [
            (1i64, item_row(1, "c1", "BREAD", 0, vec![])),
            (2i64, item_row(2, "c2", "STONE", 0, vec![])),
            (3i64, item_row(3, "c1", "ARROW", 1, vec![])),
        ]
        .into_iter()
        .collect();
        let containers: HashMap<String, ContainerRow> = [
            ("c1".to_string(), chest_row("c1")),
            ("c2".to_string(), second),
        ]
        .into_iter()
        .collect();
        // c2 surfaces first; c1's two hits still collapse into one group.
        let hits = vec![
            SearchHit { ordinal: 2, score: 0.9 },
            SearchHit { ordinal: 1, score: 0.8 },
            SearchHit { ordinal: 3, score: 0.7 },
        ];

        let tree = build_location_nodes(&hits, &rows, &containers);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].pos, BlockPos::new(100, 64, 0));
        assert_eq!(tree[1].nodes.len(), 2);
    }

    #[test]
    fn dropped_rows_are_skipped() {
        let rows: HashMap<i64, ItemRow> = HashMap::new();
        let containers: HashMap<String, ContainerRow> = HashMap::new();
        let hits = vec![SearchHit { ordinal: 42, score: 0.5 }];
        assert!(build_location_nodes(&hits, &rows, &containers).is_empty());
    }
}

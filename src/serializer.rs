//! Item-to-text serialization: walks possibly-nested container trees and
//! emits, per leaf item, a deterministic `(embedding_text, StorageRecord)`
//! pair with an explicit container path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::fingerprint::content_fingerprint;
use crate::item::{format_material_name, ContainerPath, ContainerRef, ItemView};
use crate::tags::TagRegistry;

/// Nesting cap: a shulker in a bundle in a shulker… stops here. Contents are
/// by-value copies, so cycles are impossible; the cap bounds pathological
/// hand-crafted trees.
pub const MAX_CONTAINER_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnchantmentEntry {
    pub id: String,
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurabilityInfo {
    pub current: u32,
    pub max: u32,
    pub percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialType {
    Block,
    Item,
}

/// Display metadata persisted per indexed item. Opaque to every component
/// except the metadata store and the result-tree builder. Field order is
/// fixed and enchantments are sorted, so serialization is byte-deterministic
/// for a given item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRecord {
    /// Formatted name ("Diamond Sword").
    pub name: String,
    /// Raw material id as the host reported it.
    pub material: String,
    pub amount: u32,
    pub slot: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lore: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enchantments: Vec<EnchantmentEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durability: Option<DurabilityInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rarity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub material_type: MaterialType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unbreakable: Option<bool>,
    /// Present only for items nested below the outer container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_path: Option<ContainerPath>,
}

impl StorageRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Struct serialization with fixed field order cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    /// Content fingerprint over the same inputs the serializer hashed.
    pub fn fingerprint(&self) -> u64 {
        let enchants: BTreeMap<String, u32> = self
            .enchantments
            .iter()
            .map(|e| (e.id.clone(), e.level))
            .collect();
        content_fingerprint(
            &self.material,
            self.display_name.as_deref(),
            self.custom_name.as_deref(),
            &self.lore,
            &enchants,
        )
    }

    pub fn path(&self) -> &[ContainerRef] {
        self.container_path.as_deref().unwrap_or(crate::item::ROOT_PATH)
    }
}

/// One leaf of the container tree, ready for embedding and storage.
#[derive(Debug, Clone)]
pub struct SerializedItem {
    pub embedding_text: String,
    pub record: StorageRecord,
    pub fingerprint: u64,
}

impl SerializedItem {
    pub fn slot(&self) -> u32 {
        self.record.slot
    }

    pub fn path(&self) -> &[ContainerRef] {
        self.record.path()
    }
}

/// Walk `items` depth-first and serialize every non-empty leaf. Slot indices
/// are positions in the input list; elided empty slots leave holes rather
/// than shifting later items.
pub fn serialize_items(registry: &TagRegistry, items: &[&dyn ItemView]) -> Vec<SerializedItem> {
    let mut out = Vec::new();
    walk(registry, items, &[], 0, &mut out);
    out
}

/// Convenience wrapper for concrete snapshot lists.
pub fn serialize_snapshots(
    registry: &TagRegistry,
    items: &[crate::item::ItemSnapshot],
) -> Vec<SerializedItem> {
    let views: Vec<&dyn ItemView> = items.iter().map(|i| i as &dyn ItemView).collect();
    serialize_items(registry, &views)
}

fn walk(
    registry: &TagRegistry,
    items: &[&dyn ItemView],
    path: &[ContainerRef],
    depth: usize,
    out: &mut Vec<SerializedItem>,
) {
    for (slot, item) in items.iter().enumerate() {
        if item.is_empty() {
            continue;
        }
        let slot = slot as u32;

        out.push(serialize_one(registry, *item, slot, path, depth));

        if depth >= MAX_CONTAINER_DEPTH {
            continue;
        }
        let nested: Vec<&dyn ItemView> = item
            .bundle_contents()
            .into_iter()
            .chain(item.container_contents())
            .flatten()
            .collect();
        if nested.is_empty() {
            continue;
        }

        let mut child_path = path.to_vec();
        child_path.push(ContainerRef {
            container_type: container_type_of(*item),
            color: shulker_color(item.material_id()),
            custom_name: item.custom_name().map(str::to_string),
            parent_slot: slot,
        });
        walk(registry, &nested, &child_path, depth + 1, out);
    }
}

fn serialize_one(
    registry: &TagRegistry,
    item: &dyn ItemView,
    slot: u32,
    path: &[ContainerRef],
    depth: usize,
) -> SerializedItem {
    let tags = registry.collect_tags(item);

    let mut embedding_text = format_material_name(item.material_id()).to_lowercase();
    for tag in &tags {
        embedding_text.push_str(" #");
        embedding_text.push_str(tag);
    }

    let enchantments: Vec<EnchantmentEntry> = item
        .enchantments()
        .iter()
        .map(|(id, level)| EnchantmentEntry {
            id: id.clone(),
            level: *level,
        })
        .collect();

    let record = StorageRecord {
        name: format_material_name(item.material_id()),
        material: item.material_id().to_string(),
        amount: item.amount(),
        slot,
        display_name: item.display_name().map(str::to_string),
        custom_name: item.custom_name().map(str::to_string),
        lore: item.lore().to_vec(),
        enchantments,
        durability: item.durability().map(|d| DurabilityInfo {
            current: d.current,
            max: d.max,
            percent: d.percent(),
        }),
        rarity: item.rarity().map(str::to_string),
        category: item.creative_category().map(str::to_string),
        material_type: if item.is_block() {
            MaterialType::Block
        } else {
            MaterialType::Item
        },
        unbreakable: item.is_unbreakable().then_some(true),
        container_path: (depth > 0).then(|| path.to_vec()),
    };

    let fingerprint = record.fingerprint();

    SerializedItem {
        embedding_text,
        record,
        fingerprint,
    }
}

fn container_type_of(item: &dyn ItemView) -> String {
    if let Some(t) = item.container_type() {
        return t.to_ascii_lowercase();
    }
    material_container_type(item.material_id())
}

/// Normalized container kind for a material id ("RED_SHULKER_BOX" →
/// "shulker_box"); non-container materials map to their bare lowercase id.
pub(crate) fn material_container_type(material_id: &str) -> String {
    let bare = material_id
        .rsplit(':')
        .next()
        .unwrap_or(material_id)
        .to_ascii_lowercase();
    if bare.ends_with("shulker_box") {
        "shulker_box".to_string()
    } else if bare == "bundle" || bare.ends_with("_bundle") {
        "bundle".to_string()
    } else {
        bare
    }
}

/// "RED_SHULKER_BOX" → Some("red"); undyed boxes have no color.
fn shulker_color(material_id: &str) -> Option<String> {
    let bare = material_id.rsplit(':').next().unwrap_or(material_id).to_ascii_lowercase();
    bare.strip_suffix("_shulker_box")
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

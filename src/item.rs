use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// World coordinates
// ---------------------------------------------------------------------------

/// Integer block coordinates. `Ord` is lexicographic over `(x, y, z)`; the
/// smallest block of a multi-block container is its primary location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn distance_sq(&self, other: &BlockPos) -> f64 {
        let dx = f64::from(self.x - other.x);
        let dy = f64::from(self.y - other.y);
        let dz = f64::from(self.z - other.z);
        dx * dx + dy * dy + dz * dz
    }
}

impl std::fmt::Display for BlockPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

/// A block position qualified by its world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub world: String,
    pub pos: BlockPos,
}

impl Location {
    pub fn new(world: impl Into<String>, x: i32, y: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            pos: BlockPos::new(x, y, z),
        }
    }
}

/// One logical inventory spanning one or more blocks (double chests span
/// two). All blocks share a world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLocations {
    pub world: String,
    pub blocks: Vec<BlockPos>,
}

impl ContainerLocations {
    pub fn single(world: impl Into<String>, x: i32, y: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            blocks: vec![BlockPos::new(x, y, z)],
        }
    }

    /// The lexicographically smallest block — the container's stable anchor.
    pub fn primary(&self) -> Option<BlockPos> {
        self.blocks.iter().min().copied()
    }
}

// ---------------------------------------------------------------------------
// Container paths
// ---------------------------------------------------------------------------

/// One step into a nested container: "the red shulker box in slot 5".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerRef {
    pub container_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    pub parent_slot: u32,
}

/// Ordered list of [`ContainerRef`]s locating an item inside nested
/// containers. Empty = directly inside the outer container.
pub type ContainerPath = Vec<ContainerRef>;

/// Shared root path constant; compare against this instead of allocating.
pub const ROOT_PATH: &[ContainerRef] = &[];

// ---------------------------------------------------------------------------
// Item capability surface
// ---------------------------------------------------------------------------

/// Remaining durability of a damageable item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Durability {
    pub current: u32,
    pub max: u32,
}

impl Durability {
    pub fn percent(&self) -> f32 {
        if self.max == 0 {
            return 0.0;
        }
        (self.current as f32 / self.max as f32) * 100.0
    }
}

/// Read-only handle onto a single item instance.
///
/// The serializer and every tag provider consume items exclusively through
/// this capability set; platform adapters implement it over the host game's
/// native item type. Nested contents are by-value copies, so container trees
/// are always acyclic.
pub trait ItemView {
    fn material_id(&self) -> &str;
    fn amount(&self) -> u32;
    fn display_name(&self) -> Option<&str>;
    fn custom_name(&self) -> Option<&str>;
    fn lore(&self) -> &[String];
    /// Enchantment id → level, naturally sorted by id.
    fn enchantments(&self) -> &BTreeMap<String, u32>;
    fn durability(&self) -> Option<Durability>;
    fn rarity(&self) -> Option<&str>;
    fn is_unbreakable(&self) -> bool;
    fn is_solid(&self) -> bool;
    fn is_occluding(&self) -> bool;
    fn has_gravity(&self) -> bool;
    fn is_block(&self) -> bool;
    fn container_contents(&self) -> Option<Vec<&dyn ItemView>>;
    fn bundle_contents(&self) -> Option<Vec<&dyn ItemView>>;
    fn container_type(&self) -> Option<&str>;
    fn creative_category(&self) -> Option<&str>;

    /// Empty/air items are elided by the serializer without shifting slots.
    fn is_empty(&self) -> bool {
        let m = self.material_id();
        m.is_empty() || m.eq_ignore_ascii_case("air") || self.amount() == 0
    }
}

/// Concrete, serde-friendly [`ItemView`] used by the inventory feed, the
/// CLI snapshot format, and the test suite.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemSnapshot {
    pub material: String,
    /// Stack size; JSON snapshots that omit it mean a single item.
    #[serde(default = "one")]
    pub amount: u32,
    pub display_name: Option<String>,
    pub custom_name: Option<String>,
    pub lore: Vec<String>,
    pub enchantments: BTreeMap<String, u32>,
    pub durability: Option<Durability>,
    pub rarity: Option<String>,
    pub unbreakable: bool,
    pub solid: bool,
    pub occluding: bool,
    pub gravity: bool,
    pub block: bool,
    pub container: Option<Vec<ItemSnapshot>>,
    pub bundle: Option<Vec<ItemSnapshot>>,
    pub container_type: Option<String>,
    pub creative_category: Option<String>,
}

fn one() -> u32 {
    1
}

impl ItemSnapshot {
    pub fn new(material: impl Into<String>) -> Self {
        Self {
            material: material.into(),
            amount: 1,
            ..Self::default()
        }
    }

    pub fn with_amount(mut self, amount: u32) -> Self {
        self.amount = amount;
        self
    }

    pub fn with_enchantment(mut self, id: impl Into<String>, level: u32) -> Self {
        self.enchantments.insert(id.into(), level);
        self
    }

    pub fn with_custom_name(mut self, name: impl Into<String>) -> Self {
        self.custom_name = Some(name.into());
        self
    }

    pub fn with_container(mut self, container_type: impl Into<String>, items: Vec<ItemSnapshot>) -> Self {
        self.container_type = Some(container_type.into());
        self.container = Some(items);
        self
    }

    pub fn with_bundle(mut self, items: Vec<ItemSnapshot>) -> Self {
        self.bundle = Some(items);
        self
    }
}

impl ItemView for ItemSnapshot {
    fn material_id(&self) -> &str {
        &self.material
    }

    fn amount(&self) -> u32 {
        self.amount
    }

    fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    fn custom_name(&self) -> Option<&str> {
        self.custom_name.as_deref()
    }

    fn lore(&self) -> &[String] {
        &self.lore
    }

    fn enchantments(&self) -> &BTreeMap<String, u32> {
        &self.enchantments
    }

    fn durability(&self) -> Option<Durability> {
        self.durability
    }

    fn rarity(&self) -> Option<&str> {
        self.rarity.as_deref()
    }

    fn is_unbreakable(&self) -> bool {
        self.unbreakable
    }

    fn is_solid(&self) -> bool {
        self.solid
    }

    fn is_occluding(&self) -> bool {
        self.occluding
    }

    fn has_gravity(&self) -> bool {
        self.gravity
    }

    fn is_block(&self) -> bool {
        self.block
    }

    fn container_contents(&self) -> Option<Vec<&dyn ItemView>> {
        self.container
            .as_ref()
            .map(|items| items.iter().map(|i| i as &dyn ItemView).collect())
    }

    fn bundle_contents(&self) -> Option<Vec<&dyn ItemView>> {
        self.bundle
            .as_ref()
            .map(|items| items.iter().map(|i| i as &dyn ItemView).collect())
    }

    fn container_type(&self) -> Option<&str> {
        self.container_type.as_deref()
    }

    fn creative_category(&self) -> Option<&str> {
        self.creative_category.as_deref()
    }
}

/// "DIAMOND_SWORD" → "Diamond Sword". Also accepts lowercase namespaced ids
/// ("minecraft:diamond_sword" keeps only the path part).
pub fn format_material_name(material_id: &str) -> String {
    let bare = material_id.rsplit(':').next().unwrap_or(material_id);
    bare.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_name_formatting() {
        assert_eq!(format_material_name("DIAMOND_SWORD"), "Diamond Sword");
        assert_eq!(format_material_name("minecraft:oak_log"), "Oak Log");
        assert_eq!(format_material_name("BREAD"), "Bread");
    }

    #[test]
    fn primary_block_is_lexicographic_minimum() {
        let locs = ContainerLocations {
            world: "w0".into(),
            blocks: vec![BlockPos::new(10, 64, 9), BlockPos::new(10, 63, 20)],
        };
        assert_eq!(locs.primary(), Some(BlockPos::new(10, 63, 20)));
    }

    #[test]
    fn air_and_zero_amount_are_empty() {
        assert!(ItemSnapshot::new("AIR").is_empty());
        assert!(ItemSnapshot::new("STONE").with_amount(0).is_empty());
        assert!(!ItemSnapshot::new("STONE").is_empty());
    }

    #[test]
    fn snapshot_json_defaults_to_one_item() {
        let item: ItemSnapshot = serde_json::from_str(r#"{"material": "BREAD"}"#).unwrap();
        assert_eq!(item.amount, 1);
        assert!(!item.is_empty());
    }

    #[test]
    fn durability_percent() {
        let d = Durability { current: 750, max: 1000 };
        assert!((d.percent() - 75.0).abs() < f32::EPSILON);
    }
}

use std::collections::BTreeSet;

use crate::item::ItemView;

// ---------------------------------------------------------------------------
// Tag registry — ordered providers, each a pure function over the item
// capability surface. `collect_tags` is infallible: a provider that errors
// is logged and skipped, never propagated.
// ---------------------------------------------------------------------------

pub type TagProvider = Box<dyn Fn(&dyn ItemView) -> anyhow::Result<BTreeSet<String>> + Send + Sync>;

pub struct TagRegistry {
    providers: Vec<(&'static str, TagProvider)>,
}

impl TagRegistry {
    pub fn empty() -> Self {
        Self { providers: Vec::new() }
    }

    /// Registry with every builtin provider installed, in a stable order.
    pub fn builtin() -> Self {
        let mut reg = Self::empty();
        reg.register("enchantments", Box::new(|i| Ok(enchantment_tags(i))));
        reg.register("block_flags", Box::new(|i| Ok(block_flag_tags(i))));
        reg.register("material_buckets", Box::new(|i| Ok(material_bucket_tags(i))));
        reg.register("colors", Box::new(|i| Ok(color_tags(i))));
        reg.register("kinds", Box::new(|i| Ok(kind_tags(i))));
        reg.register("food", Box::new(|i| Ok(food_tags(i))));
        reg.register("transport", Box::new(|i| Ok(transport_tags(i))));
        reg.register("redstone", Box::new(|i| Ok(redstone_tags(i))));
        reg.register("consumables", Box::new(|i| Ok(consumable_tags(i))));
        reg.register("storage", Box::new(|i| Ok(storage_tags(i))));
        reg.register("rarity", Box::new(|i| Ok(rarity_tags(i))));
        reg.register("unbreakable", Box::new(|i| Ok(unbreakable_tags(i))));
        reg
    }

    pub fn register(&mut self, name: &'static str, provider: TagProvider) {
        self.providers.push((name, provider));
    }

    /// Union of all provider outputs, lowercased. Duplicate tags collapse;
    /// failing providers are skipped with a warning.
    pub fn collect_tags(&self, item: &dyn ItemView) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        for (name, provider) in &self.providers {
            match provider(item) {
                Ok(set) => {
                    tags.extend(set.into_iter().map(|t| t.to_ascii_lowercase()));
                }
                Err(e) => {
                    tracing::warn!(provider = name, error = %e, "tag provider failed, skipping");
                }
            }
        }
        tags
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

// ---------------------------------------------------------------------------
// Builtin providers
// ---------------------------------------------------------------------------

fn tag(set: &mut BTreeSet<String>, t: &str) {
    set.insert(t.to_string());
}

/// Bare, lowercased material id without namespace ("minecraft:OAK_LOG" → "oak_log").
fn bare_material(item: &dyn ItemView) -> String {
    let id = item.material_id();
    id.rsplit(':').next().unwrap_or(id).to_ascii_lowercase()
}

fn enchantment_tags(item: &dyn ItemView) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let enchants = item.enchantments();
    if enchants.is_empty() {
        return out;
    }
    tag(&mut out, "enchanted");
    for (id, level) in enchants {
        let id = id.to_ascii_lowercase();
        out.insert(format!("{id}_{level}"));
        out.insert(id);
    }
    out
}

fn block_flag_tags(item: &dyn ItemView) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if item.is_block() {
        tag(&mut out, "block");
        if item.is_solid() {
            tag(&mut out, "solid");
        }
        if item.is_occluding() {
            tag(&mut out, "occluding");
        } else {
            tag(&mut out, "transparent");
        }
        if item.has_gravity() {
            tag(&mut out, "falling");
        }
    } else {
        tag(&mut out, "item");
    }
    out
}

const WOOD_SPECIES: &[&str] = &[
    "oak", "spruce", "birch", "jungle", "acacia", "dark_oak", "mangrove", "cherry",
    "pale_oak", "crimson", "warped", "bamboo",
];

const GEMS: &[&str] = &["diamond", "emerald", "lapis_lazuli", "amethyst_shard", "quartz", "prismarine_crystals"];

fn material_bucket_tags(item: &dyn ItemView) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let m = bare_material(item);

    if m.contains("stone") && !m.contains("redstone") {
        tag(&mut out, "stone");
    }
    if m.contains("_planks") || m.contains("_log") || m.contains("_wood") || m.starts_with("stripped_") {
        tag(&mut out, "wood");
        for species in WOOD_SPECIES {
            // Prefix match includes the separator, so "oak" cannot fire on
            // "dark_oak_planks".
            if m.starts_with(&format!("{species}_")) || m.starts_with(&format!("stripped_{species}_")) {
                out.insert((*species).to_string());
                break;
            }
        }
    }
    if m.contains("glass") {
        tag(&mut out, "glass");
    }
    if m.contains("wool") {
        tag(&mut out, "wool");
    }
    if m.contains("terracotta") {
        tag(&mut out, "terracotta");
    }
    if m.contains("concrete") {
        tag(&mut out, "concrete");
    }
    if m.contains("shulker") {
        tag(&mut out, "shulker");
    }
    if m.ends_with("_ore") || m == "ancient_debris" {
        tag(&mut out, "ore");
    }
    if m.ends_with("_ingot") {
        tag(&mut out, "ingot");
    }
    if m.ends_with("_nugget") {
        tag(&mut out, "nugget");
    }
    if GEMS.contains(&m.as_str()) {
        tag(&mut out, "gem");
    }
    if m.ends_with("candle") {
        tag(&mut out, "candle");
    }
    if m.ends_with("_banner") || m == "banner" {
        tag(&mut out, "banner");
    }
    if m.ends_with("_carpet") || m == "carpet" {
        tag(&mut out, "carpet");
    }
    out
}

const ARMOR_SLOTS: &[(&str, &str)] = &[
    ("_helmet", "helmet"),
    ("_chestplate", "chestplate"),
    ("_leggings", "leggings"),
    ("_boots", "boots"),
];

fn kind_tags(item: &dyn ItemView) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let m = bare_material(item);

    // Weapons.
    if m.ends_with("_sword") {
        tag(&mut out, "weapon");
        tag(&mut out, "sword");
    }
    if m.ends_with("_axe") {
        tag(&mut out, "weapon");
        tag(&mut out, "axe");
    }
    if m == "bow" {
        tag(&mut out, "weapon");
        tag(&mut out, "bow");
    }
    if m == "crossbow" {
        tag(&mut out, "weapon");
        tag(&mut out, "crossbow");
    }
    if m == "trident" {
        tag(&mut out, "weapon");
        tag(&mut out, "trident");
    }
    if m == "mace" {
        tag(&mut out, "weapon");
        tag(&mut out, "mace");
    }

    // Tools.
    if m.ends_with("_pickaxe") {
        tag(&mut out, "tool");
        tag(&mut out, "pickaxe");
    }
    if m.ends_with("_shovel") {
        tag(&mut out, "tool");
        tag(&mut out, "shovel");
    }
    if m.ends_with("_hoe") {
        tag(&mut out, "tool");
        tag(&mut out, "hoe");
    }
    if m == "shears" {
        tag(&mut out, "tool");
        tag(&mut out, "shears");
    }
    if m == "fishing_rod" {
        tag(&mut out, "tool");
        tag(&mut out, "fishingrod");
    }
    if m == "compass" || m == "recovery_compass" {
        tag(&mut out, "tool");
        tag(&mut out, "compass");
    }
    if m == "bucket" || m.ends_with("_bucket") {
        tag(&mut out, "tool");
        tag(&mut out, "bucket");
        if let Some(contents) = m.strip_suffix("_bucket") {
            out.insert(contents.to_string());
        }
    }

    // Armor.
    for (suffix, slot) in ARMOR_SLOTS {
        if let Some(material) = m.strip_suffix(suffix) {
            tag(&mut out, "armor");
            out.insert((*slot).to_string());
            if !material.is_empty() {
                out.insert(material.to_string());
            }
        }
    }
    if m == "elytra" {
        tag(&mut out, "elytra");
    }

    // Heads.
    if m.ends_with("_head") || m.ends_with("_skull") {
        tag(&mut out, "head");
        let mob = m
            .trim_end_matches("_head")
            .trim_end_matches("_skull")
            .to_string();
        if !mob.is_empty() {
            out.insert(mob);
        }
    }

    out
}

fn storage_tags(item: &dyn ItemView) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let m = bare_material(item);
    if m == "bundle" || m.ends_with("_bundle") {
        tag(&mut out, "storage");
        tag(&mut out, "bundle");
    }
    if m.ends_with("shulker_box") {
        tag(&mut out, "storage");
        tag(&mut out, "shulkerbox");
    }
    if m == "chest" || m == "trapped_chest" || m == "ender_chest" {
        tag(&mut out, "storage");
        tag(&mut out, "chest");
    }
    if m == "barrel" {
        tag(&mut out, "storage");
        tag(&mut out, "barrel");
    }
    out
}

const DYE_COLORS: &[&str] = &[
    "white", "light_gray", "gray", "black", "brown", "red", "orange", "yellow", "lime",
    "green", "cyan", "light_blue", "blue", "purple", "magenta", "pink",
];

/// Families whose materials carry a color prefix ("LIME_WOOL",
/// "LIGHT_BLUE_SHULKER_BOX"). The prefix test is anchored, so "gray" can
/// never fire on "light_gray_*".
const COLORED_FAMILIES: &[&str] = &[
    "wool", "carpet", "concrete", "concrete_powder", "terracotta", "glazed_terracotta",
    "stained_glass", "stained_glass_pane", "shulker_box", "candle", "banner", "bed",
    "dye", "bundle",
];

fn color_tags(item: &dyn ItemView) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let m = bare_material(item);
    for color in DYE_COLORS {
        let Some(rest) = m.strip_prefix(&format!("{color}_")) else {
            continue;
        };
        if COLORED_FAMILIES.contains(&rest) {
            out.insert((*color).to_string());
        }
        break;
    }
    out
}

const FOODS: &[&str] = &[
    "apple", "golden_apple", "enchanted_golden_apple", "bread", "cookie", "cake",
    "pumpkin_pie", "melon_slice", "sweet_berries", "glow_berries", "chorus_fruit",
    "dried_kelp", "carrot", "golden_carrot", "potato", "baked_potato", "poisonous_potato",
    "beetroot", "beef", "cooked_beef", "porkchop", "cooked_porkchop", "chicken",
    "cooked_chicken", "mutton", "cooked_mutton", "rabbit", "cooked_rabbit", "cod",
    "cooked_cod", "salmon", "cooked_salmon", "tropical_fish", "pufferfish",
    "rotten_flesh", "spider_eye", "honey_bottle", "milk_bucket",
];

fn food_tags(item: &dyn ItemView) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let m = bare_material(item);
    if FOODS.contains(&m.as_str()) || m.ends_with("_stew") || m.ends_with("_soup") {
        tag(&mut out, "food");
        if m.starts_with("cooked_") {
            tag(&mut out, "cooked");
        }
    }
    out
}

fn transport_tags(item: &dyn ItemView) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let m = bare_material(item);
    if m.ends_with("_boat") || m.ends_with("_raft") {
        tag(&mut out, "transport");
        tag(&mut out, "boat");
    }
    if m == "minecart" || m.ends_with("_minecart") {
        tag(&mut out, "transport");
        tag(&mut out, "minecart");
    }
    if m == "rail" || m.ends_with("_rail") {
        tag(&mut out, "transport");
        tag(&mut out, "rail");
    }
    if m == "saddle" {
        tag(&mut out, "transport");
        tag(&mut out, "saddle");
    }
    if let Some(animal) = m.strip_suffix("_horse_armor") {
        tag(&mut out, "armor");
        tag(&mut out, "horse");
        out.insert(animal.to_string());
    }
    out
}

const REDSTONE_PARTS: &[&str] = &[
    "redstone", "redstone_block", "redstone_torch", "redstone_lamp", "repeater",
    "comparator", "observer", "piston", "sticky_piston", "hopper", "dropper",
    "dispenser", "lever", "tripwire_hook", "target", "daylight_detector", "note_block",
];

fn redstone_tags(item: &dyn ItemView) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let m = bare_material(item);
    if REDSTONE_PARTS.contains(&m.as_str())
        || m.ends_with("_button")
        || m.ends_with("_pressure_plate")
    {
        tag(&mut out, "redstone");
    }
    out
}

fn consumable_tags(item: &dyn ItemView) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let m = bare_material(item);
    if m.starts_with("music_disc_") {
        tag(&mut out, "music");
        tag(&mut out, "musicdisc");
    }
    if m.ends_with("_spawn_egg") {
        tag(&mut out, "spawnegg");
    }
    if m == "potion" || m == "splash_potion" || m == "lingering_potion" {
        tag(&mut out, "potion");
    }
    if m == "arrow" || m == "spectral_arrow" || m == "tipped_arrow" {
        tag(&mut out, "arrow");
    }
    if m == "tipped_arrow" {
        tag(&mut out, "potion");
    }
    if m == "book"
        || m == "enchanted_book"
        || m == "written_book"
        || m == "writable_book"
        || m == "knowledge_book"
    {
        tag(&mut out, "book");
    }
    if m.ends_with("_dye") {
        tag(&mut out, "dye");
    }
    if m.ends_with("_seeds") {
        tag(&mut out, "seeds");
        tag(&mut out, "farming");
    }
    if m.ends_with("_sapling") {
        tag(&mut out, "sapling");
    }
    out
}

fn rarity_tags(item: &dyn ItemView) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if let Some(rarity) = item.rarity() {
        let rarity = rarity.trim().to_ascii_lowercase();
        if !rarity.is_empty() {
            out.insert(rarity);
        }
    }
    out
}

fn unbreakable_tags(item: &dyn ItemView) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if item.is_unbreakable() {
        tag(&mut out, "unbreakable");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemSnapshot;

    fn tags_of(item: &ItemSnapshot) -> BTreeSet<String> {
        TagRegistry::builtin().collect_tags(item)
    }

    #[test]
    fn enchanted_sword_gets_weapon_and_enchant_tags() {
        let sword = ItemSnapshot::new("DIAMOND_SWORD").with_enchantment("sharpness", 5);
        let tags = tags_of(&sword);
        for expected in ["weapon", "sword", "enchanted", "sharpness", "sharpness_5", "item"] {
            assert!(tags.contains(expected), "missing tag {expected:?} in {tags:?}");
        }
    }

    #[test]
    fn shulker_box_is_storage_and_shulker() {
        let mut sb = ItemSnapshot::new("RED_SHULKER_BOX");
        sb.block = true;
        sb.solid = true;
        let tags = tags_of(&sb);
        for expected in ["storage", "shulkerbox", "shulker", "block", "solid", "transparent"] {
            assert!(tags.contains(expected), "missing tag {expected:?} in {tags:?}");
        }
    }

    #[test]
    fn armor_tags_carry_slot_and_material() {
        let tags = tags_of(&ItemSnapshot::new("NETHERITE_CHESTPLATE"));
        for expected in ["armor", "chestplate", "netherite"] {
            assert!(tags.contains(expected), "missing tag {expected:?} in {tags:?}");
        }
    }

    #[test]
    fn bucket_fluid_tag() {
        let tags = tags_of(&ItemSnapshot::new("LAVA_BUCKET"));
        for expected in ["tool", "bucket", "lava"] {
            assert!(tags.contains(expected), "missing tag {expected:?} in {tags:?}");
        }
    }

    #[test]
    fn wood_species_prefers_longest_match() {
        let tags = tags_of(&ItemSnapshot::new("DARK_OAK_PLANKS"));
        assert!(tags.contains("wood"));
        assert!(tags.contains("dark_oak"), "{tags:?}");
        assert!(!tags.contains("oak"), "{tags:?}");
    }

    #[test]
    fn failing_provider_is_skipped() {
        let mut reg = TagRegistry::builtin();
        reg.register("broken", Box::new(|_| anyhow::bail!("host API unavailable")));
        let tags = reg.collect_tags(&ItemSnapshot::new("BREAD"));
        assert!(tags.contains("item"));
    }

    #[test]
    fn colored_family_materials_get_their_color() {
        let tags = tags_of(&ItemSnapshot::new("LIGHT_BLUE_WOOL"));
        assert!(tags.contains("light_blue"), "{tags:?}");
        assert!(!tags.contains("blue"), "{tags:?}");
        assert!(tags.contains("wool"));

        // Color prefixes outside the colored families stay untagged.
        let sand = tags_of(&ItemSnapshot::new("RED_SAND"));
        assert!(!sand.contains("red"), "{sand:?}");
    }

    #[test]
    fn cooked_food_is_food_and_cooked() {
        let tags = tags_of(&ItemSnapshot::new("COOKED_BEEF"));
        assert!(tags.contains("food"));
        assert!(tags.contains("cooked"));
        let stew = tags_of(&ItemSnapshot::new("RABBIT_STEW"));
        assert!(stew.contains("food"));
    }

    #[test]
    fn transport_and_redstone_buckets() {
        let boat = tags_of(&ItemSnapshot::new("OAK_BOAT"));
        assert!(boat.contains("transport") && boat.contains("boat"));
        let cart = tags_of(&ItemSnapshot::new("HOPPER_MINECART"));
        assert!(cart.contains("minecart"));
        let plate = tags_of(&ItemSnapshot::new("STONE_PRESSURE_PLATE"));
        assert!(plate.contains("redstone"));
    }

    #[test]
    fn consumable_buckets() {
        assert!(tags_of(&ItemSnapshot::new("MUSIC_DISC_CAT")).contains("musicdisc"));
        assert!(tags_of(&ItemSnapshot::new("ZOMBIE_SPAWN_EGG")).contains("spawnegg"));
        assert!(tags_of(&ItemSnapshot::new("SPLASH_POTION")).contains("potion"));
        let tipped = tags_of(&ItemSnapshot::new("TIPPED_ARROW"));
        assert!(tipped.contains("arrow") && tipped.contains("potion"));
        assert!(tags_of(&ItemSnapshot::new("ENCHANTED_BOOK")).contains("book"));
        assert!(tags_of(&ItemSnapshot::new("WHEAT_SEEDS")).contains("farming"));
    }

    #[test]
    fn rarity_becomes_a_tag() {
        let mut epic = ItemSnapshot::new("ELYTRA");
        epic.rarity = Some("Epic".to_string());
        let tags = tags_of(&epic);
        assert!(tags.contains("epic"), "{tags:?}");
        assert!(tags.contains("elytra"));
    }

    #[test]
    fn gravity_block_is_falling() {
        let mut sand = ItemSnapshot::new("SAND");
        sand.block = true;
        sand.solid = true;
        sand.gravity = true;
        let tags = tags_of(&sand);
        assert!(tags.contains("falling"));
        assert!(tags.contains("block"));
    }
}

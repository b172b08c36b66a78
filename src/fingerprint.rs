//! Stable 64-bit content fingerprints for the embedding cache.
//!
//! The fingerprint is xxh3_64 over a length-prefixed canonical encoding of
//! exactly these inputs, in this order:
//!
//! 1. material id (namespace stripped, lowercased)
//! 2. display name (optional)
//! 3. custom name (optional)
//! 4. lore lines, in order
//! 5. enchantment `(id, level)` pairs, sorted by id
//!
//! Amount, slot, durability, and container path are excluded: two stacks of
//! the same content must share a fingerprint regardless of stack size or
//! where they sit. The encoding distinguishes `None` from `Some("")` and an
//! empty list from an absent one, so field boundaries can never alias.
//! These inputs are frozen; changing them invalidates every cached vector.

use std::collections::BTreeMap;

use xxhash_rust::xxh3::Xxh3;

use crate::item::ItemView;

const FIELD_ABSENT: u8 = 0;
const FIELD_PRESENT: u8 = 1;

fn push_bytes(h: &mut Xxh3, bytes: &[u8]) {
    h.update(&(bytes.len() as u32).to_le_bytes());
    h.update(bytes);
}

fn push_opt(h: &mut Xxh3, field: Option<&str>) {
    match field {
        Some(s) => {
            h.update(&[FIELD_PRESENT]);
            push_bytes(h, s.as_bytes());
        }
        None => h.update(&[FIELD_ABSENT]),
    }
}

/// Fingerprint from the raw content fields. `enchantments` must be sorted by
/// id; both call sites pass a `BTreeMap`, which guarantees it.
pub fn content_fingerprint(
    material_id: &str,
    display_name: Option<&str>,
    custom_name: Option<&str>,
    lore: &[String],
    enchantments: &BTreeMap<String, u32>,
) -> u64 {
    let mut h = Xxh3::new();

    let bare = material_id.rsplit(':').next().unwrap_or(material_id);
    push_bytes(&mut h, bare.to_ascii_lowercase().as_bytes());

    push_opt(&mut h, display_name);
    push_opt(&mut h, custom_name);

    h.update(&(lore.len() as u32).to_le_bytes());
    for line in lore {
        push_bytes(&mut h, line.as_bytes());
    }

    h.update(&(enchantments.len() as u32).to_le_bytes());
    for (id, level) in enchantments {
        push_bytes(&mut h, id.to_ascii_lowercase().as_bytes());
        h.update(&level.to_le_bytes());
    }

    h.digest()
}

/// Fingerprint straight off the item capability surface.
pub fn item_fingerprint(item: &dyn ItemView) -> u64 {
    content_fingerprint(
        item.material_id(),
        item.display_name(),
        item.custom_name(),
        item.lore(),
        item.enchantments(),
    )
}

/// SQLite stores the fingerprint as a bit-cast signed integer.
pub fn to_db_key(fp: u64) -> i64 {
    fp as i64
}

pub fn from_db_key(key: i64) -> u64 {
    key as u64
}

//! lootlens — semantic index for game-world storage containers.
//!
//! Container snapshots flow through the serializer into an embedding
//! pipeline (remote HTTP or local ONNX), vectors are cached by content
//! fingerprint and indexed in an approximate-nearest-neighbor graph, and
//! natural-language queries come back as location-grouped item trees.

pub mod cache;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod indexer;
pub mod item;
pub mod metadata;
pub mod search;
pub mod serializer;
pub mod tags;

pub use config::{load_config, Config};
pub use engine::{AccessPolicy, Engine, EngineStats};
pub use error::{Error, Result};
pub use indexer::{ContainerSnapshot, InventorySource};
pub use item::{BlockPos, ContainerLocations, ContainerRef, ItemSnapshot, ItemView, Location};
pub use search::{ContainerNode, ItemHit, LocationNode, ResultNode};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::path::PathBuf;

use lootlens::item::{BlockPos, ContainerLocations, ItemSnapshot};
use lootlens::search::{LocationNode, ResultNode};
use lootlens::{load_config, Engine};

#[derive(Debug, Parser)]
#[command(name = "lootlens")]
#[command(version)]
#[command(about = "Semantic search over game-world storage containers")]
struct Cli {
    /// Data directory (config, databases, index artifacts, models)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Index container snapshots from a JSON file
    Index {
        /// JSON file: [{"world", "blocks": [{"x","y","z"}], "container_type", "items": [...]}]
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Run a natural-language query against the index
    Query {
        #[arg(value_name = "TEXT")]
        text: String,

        /// Max results
        #[arg(short, long, default_value_t = 10)]
        k: usize,
    },
    /// Show store and index statistics
    Stats,
    /// Delete every indexed item, container, cached embedding, and artifact
    Purge,
}

#[derive(Debug, Deserialize)]
struct SnapshotEntry {
    world: String,
    blocks: Vec<BlockPos>,
    #[serde(default = "default_container_type")]
    container_type: String,
    #[serde(default)]
    items: Vec<ItemSnapshot>,
}

fn default_container_type() -> String {
    "chest".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.data_dir {
        Some(dir) => {
            let mut c = load_config(&dir);
            c.data_dir = dir;
            c
        }
        None => {
            let defaults = lootlens::Config::default();
            load_config(&defaults.data_dir)
        }
    };

    let engine = Engine::open(config).await.context("failed to open engine")?;

    let result = run(&engine, cli.command).await;
    engine.shutdown().await.ok();
    result
}

async fn run(engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::Index { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let entries: Vec<SnapshotEntry> =
                serde_json::from_str(&text).context("snapshot file is not valid JSON")?;

            let bar = ProgressBar::new(entries.len() as u64);
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner} [{bar:30}] {pos}/{len} containers {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );

            for entry in entries {
                let locations = ContainerLocations {
                    world: entry.world,
                    blocks: entry.blocks,
                };
                engine.schedule_index(locations, entry.container_type, &entry.items)?;
                bar.inc(1);
            }
            bar.set_message("waiting for jobs…");
            engine.drain().await;
            bar.finish_with_message("done");

            let stats = engine.stats().await?;
            println!(
                "Indexed {} items across {} containers ({} vectors).",
                stats.items, stats.containers, stats.indexed_vectors
            );
        }

        Command::Query { text, k } => {
            let results = engine.search(&text, k).await?;
            if results.is_empty() {
                println!("No matches.");
            } else {
                for location in &results {
                    print_location(location);
                }
            }
        }

        Command::Stats => {
            let stats = engine.stats().await?;
            println!("containers          {}", stats.containers);
            println!("items               {}", stats.items);
            println!("cached embeddings   {}", stats.cached_embeddings);
            println!("indexed vectors     {}", stats.indexed_vectors);
            println!("index dirty         {}", stats.index_dirty);
            println!("dimension           {}", engine.embedding_dimension());
        }

        Command::Purge => {
            engine.purge().await?;
            println!("All indexed data removed.");
        }
    }
    Ok(())
}

fn print_location(location: &LocationNode) {
    println!(
        "{} @ {} ({})",
        location.world, location.pos, location.container_type
    );
    for node in &location.nodes {
        print_node(node, 1);
    }
}

fn print_node(node: &ResultNode, depth: usize) {
    let pad = "  ".repeat(depth);
    match node {
        ResultNode::Container(c) => {
            let color = c.color.as_deref().unwrap_or("");
            let name = c.custom_name.as_deref().unwrap_or("");
            let score = c
                .score_percent
                .map(|s| format!(" {s}%"))
                .unwrap_or_default();
            println!(
                "{pad}[{}{}{}] slot {}{}",
                color,
                if color.is_empty() { "" } else { " " },
                c.container_type,
                c.slot,
                score
            );
            for child in &c.children {
                print_node(child, depth + 1);
            }
        }
        ResultNode::Item(item) => {
            let count = if item.record.amount > 1 {
                format!(" x{}", item.record.amount)
            } else {
                String::new()
            };
            println!(
                "{pad}{}{} — slot {} — {}%",
                item.record.name, count, item.slot, item.score_percent
            );
        }
    }
}

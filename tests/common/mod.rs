//! Shared test fixtures: a deterministic embedding provider and engine
//! construction helpers. No network, no model files.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use lootlens::embedding::{l2_normalize, EmbeddingProvider, TaskType};
use lootlens::{Config, Engine};

pub const TEST_DIM: usize = 256;

/// Bag-of-tokens embedding with a per-instance vocabulary: every distinct
/// token gets its own coordinate, so two texts overlap exactly when they
/// share tokens. Leading `#` is stripped so the query "weapon" lines up
/// with the serializer's `#weapon` tag.
pub struct TokenVocabProvider {
    vocab: Mutex<HashMap<String, usize>>,
    pub batch_calls: AtomicUsize,
    pub texts_embedded: AtomicUsize,
}

impl TokenVocabProvider {
    pub fn new() -> Self {
        Self {
            vocab: Mutex::new(HashMap::new()),
            batch_calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; TEST_DIM];
        let mut vocab = self.vocab.lock();
        for token in text.split_whitespace() {
            let token = token.trim_start_matches('#').to_string();
            let next = vocab.len();
            let coord = *vocab.entry(token).or_insert(next);
            assert!(coord < TEST_DIM, "test vocabulary overflow");
            v[coord] += 1.0;
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for TokenVocabProvider {
    async fn embed_batch(
        &self,
        texts: &[String],
        _task: TaskType,
    ) -> lootlens::Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        TEST_DIM
    }
}

/// Engine over a temp dir with a short debounce and the vocab provider.
pub async fn test_engine(dir: &std::path::Path) -> (Engine, Arc<TokenVocabProvider>) {
    let provider = Arc::new(TokenVocabProvider::new());
    let mut config = Config::default();
    config.data_dir = dir.to_path_buf();
    config.index.debounce_ms = 40;
    let engine = Engine::with_provider(config, Arc::clone(&provider) as Arc<dyn EmbeddingProvider>)
        .await
        .expect("engine open");
    (engine, provider)
}

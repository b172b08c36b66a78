//! Text-to-vector providers. Every provider returns unit-norm vectors of a
//! fixed, provider-declared dimension; callers never retry here (retry
//! policy belongs to the indexer).

pub mod local;
pub mod remote;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{EmbeddingConfig, PrefixChoice, ProviderKind};
use crate::error::{Error, Result};

/// Norm tolerance for vectors entering the cache or the index.
pub const NORM_EPSILON: f32 = 1e-3;

/// Intent hint to the embedding model. Local models turn this into a text
/// prefix; remote services receive it as a parameter when supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    RetrievalDocument,
    RetrievalQuery,
    Clustering,
    Classification,
}

impl TaskType {
    pub fn api_name(self) -> &'static str {
        match self {
            TaskType::RetrievalDocument => "retrieval_document",
            TaskType::RetrievalQuery => "retrieval_query",
            TaskType::Clustering => "clustering",
            TaskType::Classification => "classification",
        }
    }
}

/// Closed set of task-prefix conventions. Resolved from config/model id once
/// at provider construction — call sites only ever see `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrefixStrategy {
    #[default]
    None,
    Nomic,
    E5Instruct,
}

const E5_QUERY_INSTRUCT: &str =
    "Instruct: Given a search query, retrieve relevant passages that answer the query\nQuery: ";

impl PrefixStrategy {
    pub fn resolve(choice: PrefixChoice, model_id: &str) -> Self {
        match choice {
            PrefixChoice::None => Self::None,
            PrefixChoice::Nomic => Self::Nomic,
            PrefixChoice::E5Instruct => Self::E5Instruct,
            PrefixChoice::Auto => {
                let id = model_id.to_ascii_lowercase();
                if id.contains("nomic") {
                    Self::Nomic
                } else if id.contains("e5") && id.contains("instruct") {
                    Self::E5Instruct
                } else {
                    Self::None
                }
            }
        }
    }

    pub fn apply(self, text: &str, task: TaskType) -> String {
        match self {
            Self::None => text.to_string(),
            Self::Nomic => {
                let prefix = match task {
                    TaskType::RetrievalDocument => "search_document: ",
                    TaskType::RetrievalQuery => "search_query: ",
                    TaskType::Clustering => "clustering: ",
                    TaskType::Classification => "classification: ",
                };
                format!("{prefix}{text}")
            }
            Self::E5Instruct => match task {
                TaskType::RetrievalQuery => format!("{E5_QUERY_INSTRUCT}{text}"),
                _ => text.to_string(),
            },
        }
    }
}

/// Scale `v` to unit L2 norm in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn is_unit_norm(v: &[f32]) -> bool {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    (norm - 1.0).abs() <= NORM_EPSILON
}

/// Pluggable text-to-vector backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch; output order matches input order.
    async fn embed_batch(&self, texts: &[String], task: TaskType) -> Result<Vec<Vec<f32>>>;

    /// Declared output dimension.
    fn dimension(&self) -> usize;

    async fn embed_one(&self, text: &str, task: TaskType) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()], task).await?;
        out.pop()
            .ok_or_else(|| Error::embedding("provider returned an empty batch"))
    }
}

/// Construct the configured provider. Remote providers probe their dimension
/// here when it is not configured; local providers load model + tokenizer.
pub async fn provider_from_config(
    cfg: &EmbeddingConfig,
    models_dir: &Path,
) -> Result<Arc<dyn EmbeddingProvider>> {
    match cfg.provider {
        ProviderKind::Remote => {
            let provider = remote::RemoteProvider::connect(cfg).await?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Local => {
            let provider = local::LocalProvider::load(cfg, models_dir).await?;
            Ok(Arc::new(provider))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nomic_prefixes_by_task() {
        let s = PrefixStrategy::Nomic;
        assert_eq!(
            s.apply("iron ingot", TaskType::RetrievalDocument),
            "search_document: iron ingot"
        );
        assert_eq!(
            s.apply("food", TaskType::RetrievalQuery),
            "search_query: food"
        );
        assert_eq!(s.apply("x", TaskType::Clustering), "clustering: x");
        assert_eq!(s.apply("x", TaskType::Classification), "classification: x");
    }

    #[test]
    fn e5_prefixes_queries_only() {
        let s = PrefixStrategy::E5Instruct;
        assert_eq!(s.apply("doc text", TaskType::RetrievalDocument), "doc text");
        assert!(s
            .apply("weapon", TaskType::RetrievalQuery)
            .starts_with("Instruct: "));
    }

    #[test]
    fn auto_resolution_from_model_id() {
        use PrefixChoice::Auto;
        assert_eq!(
            PrefixStrategy::resolve(Auto, "nomic-embed-text-v1.5"),
            PrefixStrategy::Nomic
        );
        assert_eq!(
            PrefixStrategy::resolve(Auto, "multilingual-e5-large-instruct"),
            PrefixStrategy::E5Instruct
        );
        assert_eq!(
            PrefixStrategy::resolve(Auto, "text-embedding-3-small"),
            PrefixStrategy::None
        );
        assert_eq!(
            PrefixStrategy::resolve(PrefixChoice::None, "nomic-embed-text-v1.5"),
            PrefixStrategy::None
        );
    }

    #[test]
    fn normalization_reaches_unit_norm() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!(is_unit_norm(&v));
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_stays_zero() {
        let mut v = vec![0.0f32; 8];
        l2_normalize(&mut v);
        assert!(v.iter().all(|x| *x == 0.0));
    }
}

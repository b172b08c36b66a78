//! Remote HTTP embedding provider. Speaks the OpenAI-style JSON shape
//! (`{"input": [...], "model": "..."}` → `{"data": [{"embedding": [...]}]}`)
//! with bearer auth. ureq is fully synchronous, so every request runs on the
//! blocking pool with connect/read timeouts enforced per agent.

use std::time::Duration;

use serde_json::{json, Value};

use crate::config::EmbeddingConfig;
use crate::embedding::{l2_normalize, EmbeddingProvider, PrefixStrategy, TaskType};
use crate::error::{Error, Result};

use async_trait::async_trait;

#[derive(Clone)]
pub struct RemoteProvider {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    prefix: PrefixStrategy,
    dim: usize,
}

impl RemoteProvider {
    /// Build the agent and resolve the output dimension: configured value if
    /// present, otherwise a single probe request.
    pub async fn connect(cfg: &EmbeddingConfig) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout_read(Duration::from_millis(cfg.read_timeout_ms))
            .build();

        let mut provider = Self {
            agent,
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
            prefix: PrefixStrategy::resolve(cfg.prefix, &cfg.model),
            dim: cfg.dimension.unwrap_or(0),
        };

        if provider.dim == 0 {
            let probe = provider
                .embed_one("dimension probe", TaskType::RetrievalDocument)
                .await?;
            provider.dim = probe.len();
        }
        Ok(provider)
    }

    fn request(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        match self.request_batch(&texts) {
            Ok(vectors) => Ok(vectors),
            // Services without array-input support answer 4xx; retry the
            // same texts one at a time before giving up.
            Err(RequestFailure::Rejected) => {
                let mut out = Vec::with_capacity(texts.len());
                for text in &texts {
                    match self.request_batch(std::slice::from_ref(text)) {
                        Ok(mut vectors) if !vectors.is_empty() => out.push(vectors.remove(0)),
                        Ok(_) => {
                            return Err(Error::embedding("service returned no embedding"))
                        }
                        Err(f) => return Err(f.into_error()),
                    }
                }
                Ok(out)
            }
            Err(f) => Err(f.into_error()),
        }
    }

    fn request_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, RequestFailure> {
        let input: Value = if texts.len() == 1 {
            Value::String(texts[0].clone())
        } else {
            Value::Array(texts.iter().map(|t| Value::String(t.clone())).collect())
        };

        let mut req = self.agent.post(&self.endpoint);
        if let Some(key) = &self.api_key {
            req = req.set("Authorization", &format!("Bearer {key}"));
        }

        let resp = req
            .send_json(json!({ "input": input, "model": self.model }))
            .map_err(|e| match e {
                ureq::Error::Status(code, _) if (400..500).contains(&code) && texts.len() > 1 => {
                    RequestFailure::Rejected
                }
                other => RequestFailure::Fatal(other.to_string()),
            })?;

        let body: Value = resp
            .into_json()
            .map_err(|e| RequestFailure::Fatal(format!("malformed response body: {e}")))?;

        let mut vectors = parse_embeddings(&body)
            .ok_or_else(|| RequestFailure::Fatal("response carried no embeddings".to_string()))?;
        if vectors.len() != texts.len() {
            return Err(RequestFailure::Fatal(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        for v in &mut vectors {
            l2_normalize(v);
        }
        Ok(vectors)
    }
}

enum RequestFailure {
    /// The service rejected the request shape; worth retrying sequentially.
    Rejected,
    Fatal(String),
}

impl RequestFailure {
    fn into_error(self) -> Error {
        match self {
            RequestFailure::Rejected => Error::embedding("service rejected batch input"),
            RequestFailure::Fatal(msg) => Error::embedding(msg),
        }
    }
}

/// Accepts `{"data": [{"embedding": [...], "index": n}]}` (index optional,
/// honored when present) and the flatter `{"embeddings": [[...]]}` variant.
pub(crate) fn parse_embeddings(body: &Value) -> Option<Vec<Vec<f32>>> {
    if let Some(data) = body.get("data").and_then(Value::as_array) {
        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for (pos, entry) in data.iter().enumerate() {
            let vector = parse_vector(entry.get("embedding")?)?;
            let index = entry
                .get("index")
                .and_then(Value::as_u64)
                .map_or(pos, |i| i as usize);
            indexed.push((index, vector));
        }
        indexed.sort_by_key(|(i, _)| *i);
        return Some(indexed.into_iter().map(|(_, v)| v).collect());
    }

    if let Some(rows) = body.get("embeddings").and_then(Value::as_array) {
        return rows.iter().map(parse_vector).collect();
    }

    None
}

fn parse_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|x| x.as_f64().map(|f| f as f32))
        .collect()
}

#[async_trait]
impl EmbeddingProvider for RemoteProvider {
    async fn embed_batch(&self, texts: &[String], task: TaskType) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let prepared: Vec<String> = texts.iter().map(|t| self.prefix.apply(t, task)).collect();

        // ureq agents share their connection pool across clones.
        let this = self.clone();

        let vectors = tokio::task::spawn_blocking(move || this.request(prepared))
            .await
            .map_err(Error::embedding)??;

        if self.dim != 0 {
            if let Some(bad) = vectors.iter().find(|v| v.len() != self.dim) {
                return Err(Error::embedding(format!(
                    "service returned dimension {} (expected {})",
                    bad.len(),
                    self.dim
                )));
            }
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_shape_and_honors_index() {
        let body = json!({
            "data": [
                { "embedding": [0.0, 1.0], "index": 1 },
                { "embedding": [1.0, 0.0], "index": 0 }
            ]
        });
        let parsed = parse_embeddings(&body).unwrap();
        assert_eq!(parsed, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn parses_flat_embeddings_shape() {
        let body = json!({ "embeddings": [[0.5, 0.5, 0.0]] });
        let parsed = parse_embeddings(&body).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].len(), 3);
    }

    #[test]
    fn missing_embeddings_is_none() {
        assert!(parse_embeddings(&json!({ "error": "nope" })).is_none());
        assert!(parse_embeddings(&json!({ "data": [{ "no_embedding": [] }] })).is_none());
    }
}

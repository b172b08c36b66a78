//! Local embedding provider: an ONNX-format encoder graph plus a HuggingFace
//! tokenizer file, both loaded from `<data>/models/`. Inference is CPU-bound
//! and runs on the blocking pool.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use candle_core::{Device, Tensor};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use crate::config::EmbeddingConfig;
use crate::embedding::{l2_normalize, EmbeddingProvider, PrefixStrategy, TaskType};
use crate::error::{Error, Result};

use async_trait::async_trait;

/// Every batch is padded/truncated to this many tokens. Embedding texts are
/// a material name plus tags, far below this cap.
const MAX_SEQUENCE_LEN: usize = 256;

struct LocalModel {
    model: candle_onnx::onnx::ModelProto,
    tokenizer: Tokenizer,
    /// Graph input names, used to decide whether token_type_ids are fed.
    input_names: Vec<String>,
    /// First graph output; HashMap iteration order is not deterministic.
    output_name: String,
}

pub struct LocalProvider {
    inner: Arc<LocalModel>,
    prefix: PrefixStrategy,
    dim: usize,
}

impl LocalProvider {
    /// Load `<models_dir>/<model>.onnx` and `<models_dir>/tokenizer.json`,
    /// then probe the output dimension unless configured.
    pub async fn load(cfg: &EmbeddingConfig, models_dir: &Path) -> Result<Self> {
        let model_path = models_dir.join(format!("{}.onnx", cfg.model));
        let tokenizer_path = models_dir.join("tokenizer.json");

        let inner = tokio::task::spawn_blocking(move || -> anyhow::Result<LocalModel> {
            let model = candle_onnx::read_file(&model_path)
                .with_context(|| format!("failed to load {}", model_path.display()))?;

            let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| anyhow!("failed to load tokenizer: {e}"))?;
            tokenizer.with_padding(Some(PaddingParams {
                strategy: PaddingStrategy::Fixed(MAX_SEQUENCE_LEN),
                ..Default::default()
            }));
            tokenizer
                .with_truncation(Some(TruncationParams {
                    max_length: MAX_SEQUENCE_LEN,
                    ..Default::default()
                }))
                .map_err(|e| anyhow!("failed to configure truncation: {e}"))?;

            let graph = model
                .graph
                .as_ref()
                .ok_or_else(|| anyhow!("ONNX model has no graph"))?;
            let input_names = graph.input.iter().map(|i| i.name.clone()).collect();
            let output_name = graph
                .output
                .first()
                .map(|o| o.name.clone())
                .ok_or_else(|| anyhow!("ONNX graph declares no outputs"))?;

            Ok(LocalModel {
                model,
                tokenizer,
                input_names,
                output_name,
            })
        })
        .await
        .map_err(Error::embedding)?
        .map_err(Error::embedding)?;

        let mut provider = Self {
            inner: Arc::new(inner),
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
}

impl LocalModel {
    fn infer(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let device = Device::Cpu;

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow!("tokenizer encode failed: {e}"))?;

        let batch = encodings.len();
        let seq = encodings
            .first()
            .map(|e| e.get_ids().len())
            .unwrap_or(MAX_SEQUENCE_LEN);

        let mut ids = Vec::with_capacity(batch * seq);
        let mut mask = Vec::with_capacity(batch * seq);
        let mut types = Vec::with_capacity(batch * seq);
        for enc in &encodings {
            ids.extend(enc.get_ids().iter().map(|&x| x as i64));
            mask.extend(enc.get_attention_mask().iter().map(|&x| x as i64));
            types.extend(enc.get_type_ids().iter().map(|&x| x as i64));
        }

        let ids_t = Tensor::from_vec(ids, (batch, seq), &device)?;
        let mask_t = Tensor::from_vec(mask, (batch, seq), &device)?;

        let mut inputs: HashMap<String, Tensor> = HashMap::new();
        inputs.insert("input_ids".to_string(), ids_t);
        inputs.insert("attention_mask".to_string(), mask_t.clone());
        if self.input_names.iter().any(|n| n == "token_type_ids") {
            inputs.insert(
                "token_type_ids".to_string(),
                Tensor::from_vec(types, (batch, seq), &device)?,
            );
        }

        let mut outputs = candle_onnx::simple_eval(&self.model, inputs)
            .map_err(|e| anyhow!("ONNX eval failed: {e}"))?;
        let output = outputs
            .remove(&self.output_name)
            .ok_or_else(|| anyhow!("ONNX output {:?} missing", self.output_name))?;

        let mask_f32 = mask_t.to_dtype(candle_core::DType::F32)?;
        let pooled = pool_output(&output, &mask_f32)?;

        let mut rows = pooled.to_vec2::<f32>()?;
        for row in &mut rows {
            l2_normalize(row);
        }
        Ok(rows)
    }
}

/// Reduce the model output to `[batch, dim]`. Rank-3 outputs are the last
/// hidden state and get attention-weighted mean pooling; rank-2 outputs are
/// already sentence embeddings and pass through.
fn pool_output(output: &Tensor, attention_mask: &Tensor) -> anyhow::Result<Tensor> {
    match output.dims().len() {
        2 => Ok(output.clone()),
        3 => {
            let mask3 = attention_mask.unsqueeze(2)?; // [b, s, 1]
            let masked = output.broadcast_mul(&mask3)?;
            let summed = masked.sum(1)?; // [b, h]
            // Clamp so an all-padding row cannot divide by zero.
            let counts = attention_mask.sum_keepdim(1)?.clamp(1.0, f64::INFINITY)?;
            Ok(summed.broadcast_div(&counts)?)
        }
        rank => Err(anyhow!("unsupported ONNX output rank {rank}")),
    }
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    async fn embed_batch(&self, texts: &[String], task: TaskType) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let prepared: Vec<String> = texts.iter().map(|t| self.prefix.apply(t, task)).collect();
        let model = Arc::clone(&self.inner);

        let rows = tokio::task::spawn_blocking(move || model.infer(&prepared))
            .await
            .map_err(Error::embedding)?
            .map_err(Error::embedding)?;

        if self.dim != 0 {
            if let Some(bad) = rows.iter().find(|v| v.len() != self.dim) {
                return Err(Error::embedding(format!(
                    "model produced dimension {} (expected {})",
                    bad.len(),
                    self.dim
                )));
            }
        }
        Ok(rows)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank3_output_is_mean_pooled_with_mask() {
        let device = Device::Cpu;
        // One sequence of three tokens, hidden size 2; third token is padding.
        let hidden = Tensor::from_vec(
            vec![1.0f32, 0.0, 3.0, 4.0, 100.0, 100.0],
            (1, 3, 2),
            &device,
        )
        .unwrap();
        let mask = Tensor::from_vec(vec![1.0f32, 1.0, 0.0], (1, 3), &device).unwrap();

        let pooled = pool_output(&hidden, &mask).unwrap();
        let rows = pooled.to_vec2::<f32>().unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0][0] - 2.0).abs() < 1e-6);
        assert!((rows[0][1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn rank2_output_passes_through() {
        let device = Device::Cpu;
        let sentence = Tensor::from_vec(vec![0.6f32, 0.8], (1, 2), &device).unwrap();
        let mask = Tensor::from_vec(vec![1.0f32], (1, 1), &device).unwrap();
        let pooled = pool_output(&sentence, &mask).unwrap();
        assert_eq!(pooled.to_vec2::<f32>().unwrap(), vec![vec![0.6, 0.8]]);
    }

    #[test]
    fn all_padding_row_does_not_divide_by_zero() {
        let device = Device::Cpu;
        let hidden = Tensor::from_vec(vec![1.0f32, 1.0], (1, 1, 2), &device).unwrap();
        let mask = Tensor::from_vec(vec![0.0f32], (1, 1), &device).unwrap();
        let pooled = pool_output(&hidden, &mask).unwrap();
        let rows = pooled.to_vec2::<f32>().unwrap();
        assert!(rows[0].iter().all(|x| x.is_finite()));
    }
}

/// Model configuration and the parsed-model handle the core consumes.
///
/// The model file itself is parsed by an external loader; the core accepts
/// a `ModelHandle` carrying the architectural config, a name-to-tensor map
/// following the fixed schema (`token_embd.weight`, `blk.<i>.attn_q.weight`,
/// …, `output.weight`) and an opaque tokenizer. Weights are immutable after
/// load and shared by all sessions without locking.
#[doc(hidden)]
pub mod testmodel;

use crate::error::{NoctuaError, NoctuaResult};
use crate::tensor::Tensor;
use crate::tensor::quantized::QuantizedTensor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Normalization flavor applied before attention and MLP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    Rms,
    Layer,
}

/// MLP flavor for the feed-forward half of each block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MlpKind {
    Gelu,
    Swiglu,
}

/// Architectural parameters of a decoder-only transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub context_length: usize,
    pub embed_dim: usize,
    pub block_count: usize,
    pub head_count: usize,
    pub kv_head_count: usize,
    pub ffn_hidden: usize,
    pub rope_freq_base: f32,
    pub norm_eps: f32,
    pub norm_kind: NormKind,
    pub mlp_kind: MlpKind,
    pub use_rope: bool,
    pub use_bias: bool,
    /// Sliding attention window in tokens; `None` means full causal.
    pub sliding_window: Option<usize>,
    pub bos_token: u32,
    pub eos_token: u32,
}

impl ModelConfig {
    /// Per-head dimension, derived.
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.head_count
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_head_count * self.head_dim()
    }

    pub fn validate(&self) -> NoctuaResult<()> {
        if self.vocab_size == 0 || self.context_length == 0 || self.block_count == 0 {
            return Err(NoctuaError::InvalidConfig(
                "vocab_size, context_length and block_count must be positive".to_string(),
            ));
        }
        if self.kv_head_count == 0 {
            return Err(NoctuaError::InvalidConfig(
                "kv_head_count must be at least 1".to_string(),
            ));
        }
        if self.head_count == 0 || self.embed_dim % self.head_count != 0 {
            return Err(NoctuaError::InvalidConfig(format!(
                "embed_dim ({}) must be divisible by head_count ({})",
                self.embed_dim, self.head_count
            )));
        }
        if self.head_count % self.kv_head_count != 0 {
            return Err(NoctuaError::InvalidConfig(format!(
                "head_count ({}) must be divisible by kv_head_count ({})",
                self.head_count, self.kv_head_count
            )));
        }
        if self.norm_eps <= 0.0 {
            return Err(NoctuaError::InvalidConfig(
                "norm_eps must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A named weight: dense f32 or block-quantized.
#[derive(Debug, Clone)]
pub enum TensorRef {
    Dense(Tensor),
    Quantized(QuantizedTensor),
}

impl TensorRef {
    /// (rows, cols) of the 2-D weight.
    pub fn dims(&self) -> (usize, usize) {
        match self {
            TensorRef::Dense(t) => (t.shape()[0], t.shape()[1]),
            TensorRef::Quantized(q) => (q.rows(), q.cols()),
        }
    }
}

/// Opaque tokenizer handle. Encoding/decoding internals are collaborator
/// territory; the driver only needs the two conversions.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> String;
}

/// Per-layer tensor name following the fixed schema.
pub fn layer_tensor_name(layer: usize, suffix: &str) -> String {
    format!("blk.{}.{}", layer, suffix)
}

/// Parsed model: config, tensor map, tokenizer. Produced by an external
/// loader, validated here before any forward pass runs.
pub struct ModelHandle {
    pub id: String,
    pub config: ModelConfig,
    tensors: HashMap<String, TensorRef>,
    pub tokenizer: Arc<dyn Tokenizer>,
}

impl ModelHandle {
    pub fn new(
        id: impl Into<String>,
        config: ModelConfig,
        tensors: HashMap<String, TensorRef>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> NoctuaResult<Self> {
        config.validate()?;
        let handle = Self {
            id: id.into(),
            config,
            tensors,
            tokenizer,
        };
        handle.validate_tensors()?;
        Ok(handle)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorRef> {
        self.tensors.get(name)
    }

    /// Required tensor, with a shape check against the expectation.
    pub fn required(&self, name: &str, rows: usize, cols: usize) -> NoctuaResult<&TensorRef> {
        let t = self
            .tensors
            .get(name)
            .ok_or_else(|| NoctuaError::ShapeMismatch {
                op: "ModelHandle::required",
                expected: format!("tensor '{}'", name),
                actual: "missing".to_string(),
            })?;
        let (r, c) = t.dims();
        if (r, c) != (rows, cols) {
            return Err(NoctuaError::ShapeMismatch {
                op: "ModelHandle::required",
                expected: format!("'{}' as {}x{}", name, rows, cols),
                actual: format!("{}x{}", r, c),
            });
        }
        Ok(t)
    }

    fn validate_tensors(&self) -> NoctuaResult<()> {
        let cfg = &self.config;
        let embed = cfg.embed_dim;
        let kv_dim = cfg.kv_dim();

        self.required("token_embd.weight", cfg.vocab_size, embed)?;
        self.required("output_norm.weight", 1, embed)?;
        self.required("output.weight", embed, cfg.vocab_size)?;

        for i in 0..cfg.block_count {
            self.required(&layer_tensor_name(i, "attn_norm.weight"), 1, embed)?;
            self.required(&layer_tensor_name(i, "attn_q.weight"), embed, embed)?;
            self.required(&layer_tensor_name(i, "attn_k.weight"), embed, kv_dim)?;
            self.required(&layer_tensor_name(i, "attn_v.weight"), embed, kv_dim)?;
            self.required(&layer_tensor_name(i, "attn_output.weight"), embed, embed)?;
            self.required(&layer_tensor_name(i, "ffn_norm.weight"), 1, embed)?;
            self.required(&layer_tensor_name(i, "ffn_up.weight"), embed, cfg.ffn_hidden)?;
            self.required(&layer_tensor_name(i, "ffn_down.weight"), cfg.ffn_hidden, embed)?;
            if cfg.mlp_kind == MlpKind::Swiglu {
                self.required(&layer_tensor_name(i, "ffn_gate.weight"), embed, cfg.ffn_hidden)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("tensors", &self.tensors.len())
            .field("vocab", &self.config.vocab_size)
            .field("blocks", &self.config.block_count)
            .finish()
    }
}

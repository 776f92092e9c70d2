/// Reusable activation buffers for the forward pass.
///
/// Every intermediate the transformer touches lives here and is resized
/// (never reallocated once warm) at the top of each call, keeping the
/// steady-state decode path allocation-free. The driver owns one arena per
/// generation; nothing in here is shared.
use crate::model::ModelConfig;

#[derive(Debug, Default)]
pub struct ScratchBuffers {
    /// Residual stream, `[T, embed]`.
    pub x: Vec<f32>,
    /// Pre-norm output, `[T, embed]`.
    pub xn: Vec<f32>,
    /// Query projection, `[T, embed]`.
    pub q: Vec<f32>,
    /// Key projection, `[T, kv_dim]`.
    pub k: Vec<f32>,
    /// Value projection, `[T, kv_dim]`.
    pub v: Vec<f32>,
    /// Attention head outputs, `[T, embed]`.
    pub attn: Vec<f32>,
    /// Projection / MLP result feeding the residual add, `[T, embed]`.
    pub proj: Vec<f32>,
    /// Gate activations, `[T, ffn]`.
    pub gate: Vec<f32>,
    /// Up-projection activations, `[T, ffn]`.
    pub up: Vec<f32>,
    /// Attention scores over visible positions, one row at a time.
    pub scores: Vec<f32>,
    /// Output logits, `[T, vocab]`.
    pub logits: Vec<f32>,
}

impl ScratchBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size every buffer for a batch of `t` tokens attending over
    /// `total_positions` entries.
    pub fn prepare(&mut self, config: &ModelConfig, t: usize, total_positions: usize) {
        let embed = config.embed_dim;
        let kv_dim = config.kv_dim();
        self.x.resize(t * embed, 0.0);
        self.xn.resize(t * embed, 0.0);
        self.q.resize(t * embed, 0.0);
        self.k.resize(t * kv_dim, 0.0);
        self.v.resize(t * kv_dim, 0.0);
        self.attn.resize(t * embed, 0.0);
        self.proj.resize(t * embed, 0.0);
        self.gate.resize(t * config.ffn_hidden, 0.0);
        self.up.resize(t * config.ffn_hidden, 0.0);
        self.scores.resize(total_positions, 0.0);
        self.logits.resize(t * config.vocab_size, 0.0);
    }

    /// Logits row for batch position `t`.
    pub fn logits_row(&self, config: &ModelConfig, t: usize) -> &[f32] {
        &self.logits[t * config.vocab_size..(t + 1) * config.vocab_size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MlpKind, NormKind};

    fn config() -> ModelConfig {
        ModelConfig {
            vocab_size: 32,
            context_length: 64,
            embed_dim: 16,
            block_count: 2,
            head_count: 4,
            kv_head_count: 2,
            ffn_hidden: 32,
            rope_freq_base: 10_000.0,
            norm_eps: 1e-5,
            norm_kind: NormKind::Rms,
            mlp_kind: MlpKind::Swiglu,
            use_rope: true,
            use_bias: false,
            sliding_window: None,
            bos_token: 1,
            eos_token: 2,
        }
    }

    #[test]
    fn test_prepare_sizes() {
        let cfg = config();
        let mut scratch = ScratchBuffers::new();
        scratch.prepare(&cfg, 3, 10);
        assert_eq!(scratch.x.len(), 3 * 16);
        assert_eq!(scratch.k.len(), 3 * 8);
        assert_eq!(scratch.scores.len(), 10);
        assert_eq!(scratch.logits.len(), 3 * 32);
    }

    #[test]
    fn test_prepare_keeps_capacity_on_shrink() {
        let cfg = config();
        let mut scratch = ScratchBuffers::new();
        scratch.prepare(&cfg, 8, 64);
        let cap = scratch.x.capacity();
        scratch.prepare(&cfg, 1, 65);
        assert!(scratch.x.capacity() >= cap);
        assert_eq!(scratch.x.len(), 16);
    }

    #[test]
    fn test_logits_row() {
        let cfg = config();
        let mut scratch = ScratchBuffers::new();
        scratch.prepare(&cfg, 2, 2);
        scratch.logits[32] = 7.0;
        assert_eq!(scratch.logits_row(&cfg, 1)[0], 7.0);
    }
}

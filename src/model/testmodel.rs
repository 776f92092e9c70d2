/// Deterministic miniature models for tests and benches.
///
/// The loader is an external collaborator, so tests build `ModelHandle`s
/// directly: small dense models with hash-derived weights, a quantized
/// variant, and a "transition" model whose blocks are identity so that the
/// greedy next token is a programmable function of the last input token.
use super::{MlpKind, ModelConfig, ModelHandle, NormKind, TensorRef, Tokenizer, layer_tensor_name};
use crate::tensor::Tensor;
use crate::tensor::fp16::f32_to_f16;
use crate::tensor::quantized::{QK_BLOCK, QuantFormat, QuantizedTensor};
use std::collections::HashMap;
use std::sync::Arc;

/// Byte-level tokenizer: one token per byte, plus BOS/EOS ids past 255.
pub struct ByteTokenizer;

pub const BYTE_BOS: u32 = 256;
pub const BYTE_EOS: u32 = 257;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter(|&&t| t < 256)
            .map(|&t| t as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Config for the small dense test model.
pub fn tiny_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 32,
        context_length: 16,
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

fn hash_value(seed: u64, index: usize) -> f32 {
    // xorshift-style mix into [-0.5, 0.5)
    let mut h = seed
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(index as u64);
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    (h >> 40) as f32 / (1u64 << 24) as f32 - 0.5
}

fn dense_weight(seed: u64, rows: usize, cols: usize, scale: f32) -> TensorRef {
    let data: Vec<f32> = (0..rows * cols)
        .map(|i| hash_value(seed, i) * scale)
        .collect();
    TensorRef::Dense(Tensor::from_data(&[rows, cols], data).unwrap())
}

fn ones_weight(cols: usize) -> TensorRef {
    TensorRef::Dense(Tensor::from_data(&[1, cols], vec![1.0; cols]).unwrap())
}

fn insert_layer_weights(
    tensors: &mut HashMap<String, TensorRef>,
    cfg: &ModelConfig,
    layer: usize,
    seed: u64,
    project: &mut dyn FnMut(u64, usize, usize, f32) -> TensorRef,
) {
    let embed = cfg.embed_dim;
    let kv_dim = cfg.kv_dim();
    // ~1/sqrt(fan-in) keeps activations from drifting over layers
    let attn_scale = 1.0 / (embed as f32).sqrt();
    let ffn_scale = 1.0 / (cfg.ffn_hidden as f32).sqrt();

    let base = seed.wrapping_add(layer as u64 * 1000);
    tensors.insert(layer_tensor_name(layer, "attn_norm.weight"), ones_weight(embed));
    tensors.insert(
        layer_tensor_name(layer, "attn_q.weight"),
        project(base + 1, embed, embed, attn_scale),
    );
    tensors.insert(
        layer_tensor_name(layer, "attn_k.weight"),
        project(base + 2, embed, kv_dim, attn_scale),
    );
    tensors.insert(
        layer_tensor_name(layer, "attn_v.weight"),
        project(base + 3, embed, kv_dim, attn_scale),
    );
    tensors.insert(
        layer_tensor_name(layer, "attn_output.weight"),
        project(base + 4, embed, embed, attn_scale),
    );
    tensors.insert(layer_tensor_name(layer, "ffn_norm.weight"), ones_weight(embed));
    tensors.insert(
        layer_tensor_name(layer, "ffn_gate.weight"),
        project(base + 5, embed, cfg.ffn_hidden, attn_scale),
    );
    tensors.insert(
        layer_tensor_name(layer, "ffn_up.weight"),
        project(base + 6, embed, cfg.ffn_hidden, attn_scale),
    );
    tensors.insert(
        layer_tensor_name(layer, "ffn_down.weight"),
        project(base + 7, cfg.ffn_hidden, embed, ffn_scale),
    );
}

/// Small dense model with hash-derived weights. With `poisoned` set, one
/// attention weight in layer 0 is NaN, which must trip the divergence
/// check on the first pass.
pub fn tiny_model(seed: u64, poisoned: bool) -> Arc<ModelHandle> {
    build_tiny(seed, poisoned, None)
}

/// `tiny_model` with a sliding attention window.
pub fn tiny_model_windowed(seed: u64, window: usize) -> Arc<ModelHandle> {
    build_tiny(seed, false, Some(window))
}

fn build_tiny(seed: u64, poisoned: bool, sliding_window: Option<usize>) -> Arc<ModelHandle> {
    let mut cfg = tiny_config();
    cfg.sliding_window = sliding_window;
    let mut tensors = HashMap::new();

    tensors.insert(
        "token_embd.weight".to_string(),
        dense_weight(seed, cfg.vocab_size, cfg.embed_dim, 1.0),
    );
    let mut dense = |s, r, c, scale| dense_weight(s, r, c, scale);
    for layer in 0..cfg.block_count {
        insert_layer_weights(&mut tensors, &cfg, layer, seed, &mut dense);
    }
    tensors.insert("output_norm.weight".to_string(), ones_weight(cfg.embed_dim));
    tensors.insert(
        "output.weight".to_string(),
        dense_weight(seed + 99, cfg.embed_dim, cfg.vocab_size, 0.5),
    );

    if poisoned {
        if let Some(TensorRef::Dense(t)) = tensors.get_mut("blk.0.attn_q.weight") {
            t.data_mut()[3] = f32::NAN;
        }
    }

    Arc::new(ModelHandle::new("tiny-test", cfg, tensors, Arc::new(ByteTokenizer)).unwrap())
}

/// Quantize a dense weight into Q8_0 blocks (test-side encoder; the real
/// one lives in the loader).
pub fn quantize_q8_0(values: &[f32]) -> Vec<u8> {
    assert_eq!(values.len() % QK_BLOCK, 0);
    let mut out = Vec::with_capacity(values.len() / QK_BLOCK * 34);
    for block in values.chunks_exact(QK_BLOCK) {
        let amax = block.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let d = if amax == 0.0 { 1.0 } else { amax / 127.0 };
        // store the fp16-rounded scale and quantize against what a reader
        // will actually reconstruct
        let d_bits = f32_to_f16(d);
        let d_stored = crate::tensor::fp16::f16_to_f32(d_bits);
        out.extend_from_slice(&d_bits.to_le_bytes());
        for &v in block {
            let q = (v / d_stored).round().clamp(-127.0, 127.0) as i8;
            out.push(q as u8);
        }
    }
    out
}

/// Like `tiny_model` but with every projection stored as Q8_0. Dimensions
/// are widened so all row lengths are block-aligned.
pub fn tiny_quantized_model(seed: u64) -> Arc<ModelHandle> {
    let cfg = ModelConfig {
        vocab_size: 64,
        context_length: 32,
        embed_dim: 64,
        block_count: 2,
        head_count: 4,
        kv_head_count: 2,
        ffn_hidden: 64,
        rope_freq_base: 10_000.0,
        norm_eps: 1e-5,
        norm_kind: NormKind::Rms,
        mlp_kind: MlpKind::Swiglu,
        use_rope: true,
        use_bias: false,
        sliding_window: None,
        bos_token: 1,
        eos_token: 2,
    };

    let mut tensors = HashMap::new();
    tensors.insert(
        "token_embd.weight".to_string(),
        dense_weight(seed, cfg.vocab_size, cfg.embed_dim, 1.0),
    );
    let mut quantized = |s: u64, r: usize, c: usize, scale: f32| {
        let values: Vec<f32> = (0..r * c).map(|i| hash_value(s, i) * scale).collect();
        TensorRef::Quantized(QuantizedTensor::new(QuantFormat::Q8_0, r, c, quantize_q8_0(&values)).unwrap())
    };
    for layer in 0..cfg.block_count {
        insert_layer_weights(&mut tensors, &cfg, layer, seed, &mut quantized);
    }
    tensors.insert("output_norm.weight".to_string(), ones_weight(cfg.embed_dim));
    let out_values: Vec<f32> = (0..cfg.embed_dim * cfg.vocab_size)
        .map(|i| hash_value(seed + 99, i) * 0.5)
        .collect();
    tensors.insert(
        "output.weight".to_string(),
        TensorRef::Quantized(
            QuantizedTensor::new(
                QuantFormat::Q8_0,
                cfg.embed_dim,
                cfg.vocab_size,
                quantize_q8_0(&out_values),
            )
            .unwrap(),
        ),
    );

    Arc::new(ModelHandle::new("tiny-q8", cfg, tensors, Arc::new(ByteTokenizer)).unwrap())
}

/// Dense hash-weight model over the byte vocabulary, for exercising the
/// sampling pipeline against logits with real spread.
pub fn byte_model(seed: u64) -> Arc<ModelHandle> {
    let cfg = ModelConfig {
        vocab_size: 264,
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
        bos_token: BYTE_BOS,
        eos_token: BYTE_EOS,
    };

    let mut tensors = HashMap::new();
    tensors.insert(
        "token_embd.weight".to_string(),
        dense_weight(seed, cfg.vocab_size, cfg.embed_dim, 1.0),
    );
    let mut dense = |s, r, c, scale| dense_weight(s, r, c, scale);
    for layer in 0..cfg.block_count {
        insert_layer_weights(&mut tensors, &cfg, layer, seed, &mut dense);
    }
    tensors.insert("output_norm.weight".to_string(), ones_weight(cfg.embed_dim));
    tensors.insert(
        "output.weight".to_string(),
        dense_weight(seed + 99, cfg.embed_dim, cfg.vocab_size, 0.5),
    );

    Arc::new(ModelHandle::new("byte-test", cfg, tensors, Arc::new(ByteTokenizer)).unwrap())
}

/// A model whose blocks are no-ops (all projection weights zero), token
/// embeddings are one-hot and the LM head encodes a transition table:
/// under greedy sampling the next token is exactly `next[last]`. Unmapped
/// tokens transition to EOS.
///
/// This makes driver-level behavior (stop strings, cancellation, finish
/// reasons) scriptable without caring about real weights.
pub fn transition_model(transitions: &[(u32, u32)]) -> Arc<ModelHandle> {
    let vocab = 264; // 256 bytes + BOS/EOS + padding to keep head_dim even
    let cfg = ModelConfig {
        vocab_size: vocab,
        context_length: 64,
        embed_dim: vocab,
        block_count: 1,
        head_count: 4,
        kv_head_count: 2,
        ffn_hidden: 16,
        rope_freq_base: 10_000.0,
        norm_eps: 1e-5,
        norm_kind: NormKind::Rms,
        mlp_kind: MlpKind::Swiglu,
        use_rope: true,
        use_bias: false,
        sliding_window: None,
        bos_token: BYTE_BOS,
        eos_token: BYTE_EOS,
    };

    let map: HashMap<u32, u32> = transitions.iter().copied().collect();
    let mut tensors = HashMap::new();

    // one-hot embeddings
    let mut embd = vec![0.0f32; vocab * vocab];
    for t in 0..vocab {
        embd[t * vocab + t] = 1.0;
    }
    tensors.insert(
        "token_embd.weight".to_string(),
        TensorRef::Dense(Tensor::from_data(&[vocab, vocab], embd).unwrap()),
    );

    let mut zero = |_s: u64, r: usize, c: usize, _scale: f32| {
        TensorRef::Dense(Tensor::zeros(&[r, c]).unwrap())
    };
    insert_layer_weights(&mut tensors, &cfg, 0, 0, &mut zero);

    tensors.insert("output_norm.weight".to_string(), ones_weight(vocab));

    // transition table: the logit of next[t] dominates everything else
    let mut head = vec![0.0f32; vocab * vocab];
    for t in 0..vocab as u32 {
        let next = map.get(&t).copied().unwrap_or(BYTE_EOS);
        head[t as usize * vocab + next as usize] = 1.0;
    }
    tensors.insert(
        "output.weight".to_string(),
        TensorRef::Dense(Tensor::from_data(&[vocab, vocab], head).unwrap()),
    );

    Arc::new(ModelHandle::new("transition-test", cfg, tensors, Arc::new(ByteTokenizer)).unwrap())
}

/// Transformer forward pass.
///
/// One call takes a batch of token ids `[1, T]`, a starting position
/// offset `p0` and an optional KV cache entry, and produces logits
/// `[T, vocab]` in the caller's scratch arena. The pass is fully
/// sequential across layers and positions; causality comes from the
/// attention mask. Passes for different sessions may run on different
/// threads because they share nothing mutable.
///
/// KV writes are staged into the entry as each layer runs and committed
/// only after the whole pass is checked for divergence, so a failing call
/// leaves the cache length exactly where it started.
use super::kv_cache::KvEntry;
use super::rope::Rope;
use super::scratch::ScratchBuffers;
use crate::error::{NoctuaError, NoctuaResult};
use crate::kernels::dense::matmul_f32;
use crate::kernels::ops::{
    add_in_place, gelu_in_place, layer_norm, rms_norm, softmax, swiglu_in_place,
};
use crate::kernels::{KernelPath, matmul_fused_parallel};
use crate::model::{MlpKind, ModelHandle, NormKind, TensorRef, layer_tensor_name};
use std::sync::Arc;

struct LayerNames {
    attn_norm: String,
    attn_q: String,
    attn_k: String,
    attn_v: String,
    attn_output: String,
    ffn_norm: String,
    ffn_gate: String,
    ffn_up: String,
    ffn_down: String,
}

impl LayerNames {
    fn new(layer: usize) -> Self {
        Self {
            attn_norm: layer_tensor_name(layer, "attn_norm.weight"),
            attn_q: layer_tensor_name(layer, "attn_q.weight"),
            attn_k: layer_tensor_name(layer, "attn_k.weight"),
            attn_v: layer_tensor_name(layer, "attn_v.weight"),
            attn_output: layer_tensor_name(layer, "attn_output.weight"),
            ffn_norm: layer_tensor_name(layer, "ffn_norm.weight"),
            ffn_gate: layer_tensor_name(layer, "ffn_gate.weight"),
            ffn_up: layer_tensor_name(layer, "ffn_up.weight"),
            ffn_down: layer_tensor_name(layer, "ffn_down.weight"),
        }
    }
}

pub struct Transformer {
    model: Arc<ModelHandle>,
    path: KernelPath,
    rope: Rope,
    layers: Vec<LayerNames>,
}

impl Transformer {
    pub fn new(model: Arc<ModelHandle>, path: KernelPath) -> Self {
        let rope = Rope::new(model.config.head_dim(), model.config.rope_freq_base);
        let layers = (0..model.config.block_count).map(LayerNames::new).collect();
        Self {
            model,
            path,
            rope,
            layers,
        }
    }

    pub fn model(&self) -> &Arc<ModelHandle> {
        &self.model
    }

    pub fn kernel_path(&self) -> KernelPath {
        self.path
    }

    /// Run the forward pass; logits land in `scratch.logits`.
    pub fn forward(
        &self,
        tokens: &[u32],
        p0: usize,
        mut kv: Option<&mut KvEntry>,
        scratch: &mut ScratchBuffers,
    ) -> NoctuaResult<()> {
        let cfg = &self.model.config;
        let t = tokens.len();
        if t == 0 {
            return Err(NoctuaError::ShapeMismatch {
                op: "forward",
                expected: "at least one token".to_string(),
                actual: "empty batch".to_string(),
            });
        }

        match &kv {
            Some(entry) => {
                if entry.len() != p0 {
                    return Err(NoctuaError::ShapeMismatch {
                        op: "forward",
                        expected: format!("position offset {}", entry.len()),
                        actual: p0.to_string(),
                    });
                }
                entry.ensure_capacity(t)?;
            }
            None => {
                if p0 != 0 {
                    return Err(NoctuaError::ShapeMismatch {
                        op: "forward",
                        expected: "p0 = 0 without a kv cache".to_string(),
                        actual: p0.to_string(),
                    });
                }
            }
        }

        let total = p0 + t;
        scratch.prepare(cfg, t, total);
        self.embed(tokens, scratch)?;

        for (layer, names) in self.layers.iter().enumerate() {
            self.attention_block(layer, names, t, p0, kv.as_mut().map(|e| &mut **e), scratch)?;
            self.mlp_block(names, t, scratch)?;

            if let Some(bad) = first_non_finite(&scratch.x) {
                tracing::warn!(layer, value = bad, "non-finite activation, aborting pass");
                return Err(NoctuaError::NumericalDivergence { layer });
            }
        }

        // final norm + language-model head
        self.norm("output_norm.weight", t, &scratch.x, &mut scratch.xn)?;
        self.project(
            "output.weight",
            &scratch.xn,
            t,
            cfg.embed_dim,
            &mut scratch.logits,
        )?;
        if first_non_finite(&scratch.logits).is_some() {
            return Err(NoctuaError::NumericalDivergence {
                layer: cfg.block_count,
            });
        }

        if let Some(entry) = kv {
            entry.commit(t);
        }
        Ok(())
    }

    fn embed(&self, tokens: &[u32], scratch: &mut ScratchBuffers) -> NoctuaResult<()> {
        let cfg = &self.model.config;
        let embed = cfg.embed_dim;
        let table = self
            .model
            .tensor("token_embd.weight")
            .ok_or_else(|| NoctuaError::ShapeMismatch {
                op: "embed",
                expected: "tensor 'token_embd.weight'".to_string(),
                actual: "missing".to_string(),
            })?;
        for (ti, &token) in tokens.iter().enumerate() {
            let id = token as usize;
            if id >= cfg.vocab_size {
                return Err(NoctuaError::ShapeMismatch {
                    op: "embed",
                    expected: format!("token id < {}", cfg.vocab_size),
                    actual: token.to_string(),
                });
            }
            let dst = &mut scratch.x[ti * embed..(ti + 1) * embed];
            match table {
                TensorRef::Dense(tensor) => dst.copy_from_slice(tensor.row(id)),
                TensorRef::Quantized(q) => q.format().dequantize(q.row_bytes(id), dst)?,
            }
        }
        Ok(())
    }

    fn attention_block(
        &self,
        layer: usize,
        names: &LayerNames,
        t: usize,
        p0: usize,
        mut kv: Option<&mut KvEntry>,
        scratch: &mut ScratchBuffers,
    ) -> NoctuaResult<()> {
        let cfg = &self.model.config;
        let embed = cfg.embed_dim;
        let kv_dim = cfg.kv_dim();

        self.norm(&names.attn_norm, t, &scratch.x, &mut scratch.xn)?;
        self.project(&names.attn_q, &scratch.xn, t, embed, &mut scratch.q)?;
        self.project(&names.attn_k, &scratch.xn, t, embed, &mut scratch.k)?;
        self.project(&names.attn_v, &scratch.xn, t, embed, &mut scratch.v)?;

        if first_non_finite(&scratch.q)
            .or_else(|| first_non_finite(&scratch.k))
            .or_else(|| first_non_finite(&scratch.v))
            .is_some()
        {
            return Err(NoctuaError::NumericalDivergence { layer });
        }

        if cfg.use_rope {
            self.rope.apply(&mut scratch.q, cfg.head_count, p0);
            self.rope.apply(&mut scratch.k, cfg.kv_head_count, p0);
        }

        if let Some(entry) = kv.as_mut() {
            for ti in 0..t {
                entry
                    .k_row_mut(layer, p0 + ti)
                    .copy_from_slice(&scratch.k[ti * kv_dim..(ti + 1) * kv_dim]);
                entry
                    .v_row_mut(layer, p0 + ti)
                    .copy_from_slice(&scratch.v[ti * kv_dim..(ti + 1) * kv_dim]);
            }
        }

        // attend over positions 0..p0+T (windowed when configured), reading
        // K/V from the cache when attached, from the local batch otherwise
        {
            let ScratchBuffers {
                q, k, v, attn, scores, ..
            } = scratch;
            let (k_all, v_all): (&[f32], &[f32]) = match kv.as_ref() {
                Some(entry) => (entry.k_rows(layer), entry.v_rows(layer)),
                None => (&k[..], &v[..]),
            };

            let heads = cfg.head_count;
            let head_dim = cfg.head_dim();
            let group = heads / cfg.kv_head_count;
            let inv_scale = 1.0 / (head_dim as f32).sqrt();

            for ti in 0..t {
                let q_pos = p0 + ti;
                let window_start = match cfg.sliding_window {
                    Some(w) => (q_pos + 1).saturating_sub(w),
                    None => 0,
                };
                let visible = q_pos + 1 - window_start;
                let scores = &mut scores[..visible];

                for h in 0..heads {
                    let kvh = h / group;
                    let q_vec = &q[ti * embed + h * head_dim..][..head_dim];

                    for (si, s) in (window_start..=q_pos).enumerate() {
                        let k_row = &k_all[s * kv_dim + kvh * head_dim..][..head_dim];
                        let dot: f32 = q_vec.iter().zip(k_row).map(|(a, b)| a * b).sum();
                        scores[si] = dot * inv_scale;
                    }
                    softmax(scores);

                    let out = &mut attn[ti * embed + h * head_dim..][..head_dim];
                    out.fill(0.0);
                    for (si, s) in (window_start..=q_pos).enumerate() {
                        let w = scores[si];
                        if w == 0.0 {
                            continue;
                        }
                        let v_row = &v_all[s * kv_dim + kvh * head_dim..][..head_dim];
                        for (o, &vv) in out.iter_mut().zip(v_row) {
                            *o += w * vv;
                        }
                    }
                }
            }
        }

        self.project(&names.attn_output, &scratch.attn, t, embed, &mut scratch.proj)?;
        add_in_place(&mut scratch.x, &scratch.proj);
        Ok(())
    }

    fn mlp_block(
        &self,
        names: &LayerNames,
        t: usize,
        scratch: &mut ScratchBuffers,
    ) -> NoctuaResult<()> {
        let cfg = &self.model.config;
        let embed = cfg.embed_dim;
        let ffn = cfg.ffn_hidden;

        self.norm(&names.ffn_norm, t, &scratch.x, &mut scratch.xn)?;

        match cfg.mlp_kind {
            MlpKind::Swiglu => {
                self.project(&names.ffn_gate, &scratch.xn, t, embed, &mut scratch.gate)?;
                self.project(&names.ffn_up, &scratch.xn, t, embed, &mut scratch.up)?;
                swiglu_in_place(&mut scratch.gate, &scratch.up);
                self.project(&names.ffn_down, &scratch.gate, t, ffn, &mut scratch.proj)?;
            }
            MlpKind::Gelu => {
                self.project(&names.ffn_up, &scratch.xn, t, embed, &mut scratch.up)?;
                gelu_in_place(&mut scratch.up);
                self.project(&names.ffn_down, &scratch.up, t, ffn, &mut scratch.proj)?;
            }
        }
        add_in_place(&mut scratch.x, &scratch.proj);
        Ok(())
    }

    /// Pre-norm over each of the `t` rows of `x` into `out`.
    fn norm(&self, name: &str, t: usize, x: &[f32], out: &mut [f32]) -> NoctuaResult<()> {
        let cfg = &self.model.config;
        let embed = cfg.embed_dim;
        let weight = self.dense_weight(name)?;
        for ti in 0..t {
            let row = &x[ti * embed..(ti + 1) * embed];
            let dst = &mut out[ti * embed..(ti + 1) * embed];
            match cfg.norm_kind {
                NormKind::Rms => rms_norm(row, weight, cfg.norm_eps, dst),
                NormKind::Layer => layer_norm(row, weight, None, cfg.norm_eps, dst),
            }
        }
        Ok(())
    }

    /// `out[t, N] = a[t, K] · W[K, N]`, fused when W is quantized, plus the
    /// optional `.bias` counterpart when the model carries biases.
    fn project(
        &self,
        name: &str,
        a: &[f32],
        m: usize,
        k: usize,
        out: &mut [f32],
    ) -> NoctuaResult<()> {
        let weight = self.model.tensor(name).ok_or_else(|| NoctuaError::ShapeMismatch {
            op: "project",
            expected: format!("tensor '{}'", name),
            actual: "missing".to_string(),
        })?;
        let n = match weight {
            TensorRef::Quantized(q) => {
                matmul_fused_parallel(self.path, &a[..m * k], m, k, q, out)?;
                q.cols()
            }
            TensorRef::Dense(d) => {
                let n = d.shape()[1];
                matmul_f32(self.path, &a[..m * k], m, k, d.data(), n, out)?;
                n
            }
        };

        if self.model.config.use_bias {
            let bias_name = format!("{}.bias", name.trim_end_matches(".weight"));
            if let Some(TensorRef::Dense(bias)) = self.model.tensor(&bias_name) {
                let bias = bias.data();
                for row in out.chunks_exact_mut(n) {
                    add_in_place(row, bias);
                }
            }
        }
        Ok(())
    }

    fn dense_weight(&self, name: &str) -> NoctuaResult<&[f32]> {
        match self.model.tensor(name) {
            Some(TensorRef::Dense(t)) => Ok(t.data()),
            Some(TensorRef::Quantized(_)) => Err(NoctuaError::ShapeMismatch {
                op: "norm",
                expected: format!("dense tensor '{}'", name),
                actual: "quantized".to_string(),
            }),
            None => Err(NoctuaError::ShapeMismatch {
                op: "norm",
                expected: format!("tensor '{}'", name),
                actual: "missing".to_string(),
            }),
        }
    }
}

fn first_non_finite(x: &[f32]) -> Option<f32> {
    x.iter().copied().find(|v| !v.is_finite())
}

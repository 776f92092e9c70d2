/// Token sampling pipeline.
///
/// Applied to the last-position logit vector each step, in this fixed
/// order: temperature → top-k → softmax → min-p → top-p → multinomial.
/// A temperature of exactly zero degenerates to greedy argmax. The
/// multinomial draw uses a seeded PRNG, so identical seed, prompt and
/// parameters reproduce the token sequence bit-identically across runs.
use crate::config::SamplingParams;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;

/// Stateful sampler: one per generation. Index and probability scratch is
/// reused across steps so the decode path stays allocation-free.
pub struct Sampler {
    params: SamplingParams,
    rng: StdRng,
    indices: Vec<usize>,
    probs: Vec<f32>,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            params,
            rng,
            indices: Vec::new(),
            probs: Vec::new(),
        }
    }

    /// Sample one token id from a logit vector.
    pub fn sample(&mut self, logits: &[f32]) -> usize {
        if self.params.is_greedy() {
            return argmax(logits);
        }
        let survivors = self.prepare_distribution(logits);
        let draw: f32 = self.rng.r#gen();

        let mut cumulative = 0.0;
        for i in 0..survivors {
            let token = self.indices[i];
            cumulative += self.probs[token];
            if draw < cumulative {
                return token;
            }
        }
        // rounding slack: fall back to the last survivor
        self.indices[survivors - 1]
    }

    /// Run the filtering pipeline, leaving `probs` holding a normalized
    /// distribution over the first `n` entries of `indices` (sorted by
    /// descending probability). Returns `n`.
    fn prepare_distribution(&mut self, logits: &[f32]) -> usize {
        let n = logits.len();
        self.probs.clear();
        self.probs.extend_from_slice(logits);

        // temperature
        let inv_t = 1.0 / self.params.temperature;
        for p in self.probs.iter_mut() {
            *p *= inv_t;
        }

        // descending order survives every later monotone step
        self.indices.clear();
        self.indices.extend(0..n);
        let probs = &self.probs;
        self.indices
            .sort_unstable_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal));

        // top-k: everything past the k largest drops to -inf
        let mut kept = n;
        if self.params.top_k > 0 && self.params.top_k < n {
            kept = self.params.top_k;
            for &i in &self.indices[kept..] {
                self.probs[i] = f32::NEG_INFINITY;
            }
        }

        // softmax over the survivors
        let max = self.probs[self.indices[0]];
        let mut sum = 0.0;
        for &i in &self.indices[..kept] {
            let e = (self.probs[i] - max).exp();
            self.probs[i] = e;
            sum += e;
        }
        for &i in &self.indices[..kept] {
            self.probs[i] /= sum;
        }
        for &i in &self.indices[kept..] {
            self.probs[i] = 0.0;
        }

        // min-p: drop anything below min_p · max_prob, then renormalize
        if self.params.min_p > 0.0 {
            let threshold = self.params.min_p * self.probs[self.indices[0]];
            let mut sum = 0.0;
            let mut survivors = 0;
            for s in 0..kept {
                let i = self.indices[s];
                if self.probs[i] >= threshold {
                    sum += self.probs[i];
                    survivors += 1;
                } else {
                    self.probs[i] = 0.0;
                }
            }
            kept = survivors.max(1);
            if sum > 0.0 {
                for &i in &self.indices[..kept] {
                    self.probs[i] /= sum;
                }
            }
        }

        // top-p: shortest prefix with cumulative mass ≥ p, then renormalize
        if self.params.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut cutoff = kept;
            for s in 0..kept {
                cumulative += self.probs[self.indices[s]];
                if cumulative >= self.params.top_p {
                    cutoff = s + 1;
                    break;
                }
            }
            for &i in &self.indices[cutoff..kept] {
                self.probs[i] = 0.0;
            }
            kept = cutoff;
            let sum: f32 = self.indices[..kept].iter().map(|&i| self.probs[i]).sum();
            if sum > 0.0 {
                for &i in &self.indices[..kept] {
                    self.probs[i] /= sum;
                }
            }
        }

        kept
    }

    #[cfg(test)]
    fn distribution(&mut self, logits: &[f32]) -> Vec<(usize, f32)> {
        let kept = self.prepare_distribution(logits);
        self.indices[..kept]
            .iter()
            .map(|&i| (i, self.probs[i]))
            .collect()
    }
}

/// Greedy argmax; ties resolve to the lowest index.
fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best = i;
            best_val = v;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(temperature: f32, top_k: usize, top_p: f32, min_p: f32, seed: u64) -> SamplingParams {
        SamplingParams {
            temperature,
            top_k,
            top_p,
            min_p,
            seed,
        }
    }

    #[test]
    fn test_greedy_argmax() {
        let mut sampler = Sampler::new(params(0.0, 0, 1.0, 0.0, 42));
        assert_eq!(sampler.sample(&[0.1, 0.5, 0.3, 0.8]), 3);
        assert_eq!(sampler.sample(&[-5.0, -1.0, -3.0]), 1);
    }

    #[test]
    fn test_pipeline_reference_distribution() {
        // logits [2.0, 1.0, 0.5, -1.0] at T=0.5 scale to [4, 2, 1, -2];
        // top_k=3 drops index 3; softmax gives [0.843795, 0.114195,
        // 0.042010]; min_p=0.08 (threshold 0.0675) drops index 2;
        // renormalizing leaves [0.880797, 0.119203]; top_p=0.9 keeps both.
        let mut sampler = Sampler::new(params(0.5, 3, 0.9, 0.08, 42));
        let dist = sampler.distribution(&[2.0, 1.0, 0.5, -1.0]);

        assert_eq!(dist.len(), 2);
        assert_eq!(dist[0].0, 0);
        assert_eq!(dist[1].0, 1);
        assert!((dist[0].1 - 0.880797).abs() < 1e-4, "got {}", dist[0].1);
        assert!((dist[1].1 - 0.119203).abs() < 1e-4, "got {}", dist[1].1);
    }

    #[test]
    fn test_min_p_applies_after_softmax() {
        // without min_p all three survive the same settings, which pins the
        // filter to probability space rather than logit space
        let mut with = Sampler::new(params(0.5, 3, 1.0, 0.08, 1));
        let mut without = Sampler::new(params(0.5, 3, 1.0, 0.0, 1));
        let logits = [2.0, 1.0, 0.5, -1.0];
        assert_eq!(with.distribution(&logits).len(), 2);
        assert_eq!(without.distribution(&logits).len(), 3);
    }

    #[test]
    fn test_top_k_keeps_largest() {
        let mut sampler = Sampler::new(params(1.0, 2, 1.0, 0.0, 7));
        let dist = sampler.distribution(&[0.1, 0.5, 0.3, 0.8, 0.2]);
        assert_eq!(dist.len(), 2);
        assert_eq!(dist[0].0, 3);
        assert_eq!(dist[1].0, 1);
        let total: f32 = dist.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_top_p_prefix_cutoff() {
        // a dominant logit forms the nucleus alone
        let mut sampler = Sampler::new(params(1.0, 0, 0.5, 0.0, 9));
        let dist = sampler.distribution(&[10.0, 1.0, 0.5, 0.2]);
        assert_eq!(dist.len(), 1);
        assert_eq!(dist[0].0, 0);
        assert!((dist[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_top_p_one_keeps_all() {
        let mut sampler = Sampler::new(params(1.0, 0, 1.0, 0.0, 9));
        let dist = sampler.distribution(&[1.0, 1.0, 1.0]);
        assert_eq!(dist.len(), 3);
    }

    #[test]
    fn test_same_seed_reproduces_sequence() {
        let logits = [1.0, 2.0, 1.5, 0.5, 1.8];
        let run = |seed: u64| -> Vec<usize> {
            let mut sampler = Sampler::new(params(0.9, 4, 0.95, 0.0, seed));
            (0..20).map(|_| sampler.sample(&logits)).collect()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_different_seeds_diverge() {
        let logits = [1.0, 1.1, 0.9, 1.05, 0.95, 1.02];
        let run = |seed: u64| -> Vec<usize> {
            let mut sampler = Sampler::new(params(1.5, 0, 1.0, 0.0, seed));
            (0..30).map(|_| sampler.sample(&logits)).collect()
        };
        assert_ne!(run(1), run(2));
    }

    #[test]
    fn test_samples_respect_filter() {
        // only the top-2 tokens may ever be drawn
        let mut sampler = Sampler::new(params(1.0, 2, 1.0, 0.0, 123));
        let logits = [0.1, 3.0, 0.2, 2.5, 0.3];
        for _ in 0..50 {
            let token = sampler.sample(&logits);
            assert!(token == 1 || token == 3, "sampled filtered token {}", token);
        }
    }
}

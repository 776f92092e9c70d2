/// Engine and sampling configuration.
use crate::error::{NoctuaError, NoctuaResult};
use crate::kernels::KernelPath;
use serde::{Deserialize, Serialize};

/// Runtime-wide knobs: thread budget, KV cache bounds, scheduler limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker threads for the rayon wrappers above the kernels.
    pub n_threads: usize,
    /// Kernel path override; `None` detects the widest supported path.
    pub kernel_path: Option<KernelPath>,
    /// KV store bound on total pooled buffer bytes.
    pub kv_max_bytes: usize,
    /// KV store bound on live session entries.
    pub kv_max_entries: usize,
    /// Requests coalesced into one scheduler dispatch.
    pub max_batch_size: usize,
    /// Pending requests admitted before `QueueFull`.
    pub max_queue_depth: usize,
    /// How long a partial batch waits for more compatible requests.
    pub linger_ms: u64,
    /// Token channel capacity; the streaming backpressure bound.
    pub max_buffered_tokens: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_threads: num_cpus::get(),
            kernel_path: None,
            kv_max_bytes: 512 * 1024 * 1024,
            kv_max_entries: 64,
            max_batch_size: 8,
            max_queue_depth: 64,
            linger_ms: 2,
            max_buffered_tokens: 32,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> NoctuaResult<()> {
        if self.n_threads == 0 {
            return Err(NoctuaError::InvalidConfig(
                "n_threads must be at least 1".to_string(),
            ));
        }
        if self.kv_max_bytes == 0 || self.kv_max_entries == 0 {
            return Err(NoctuaError::InvalidConfig(
                "kv cache bounds must be positive".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(NoctuaError::InvalidConfig(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_queue_depth == 0 {
            return Err(NoctuaError::InvalidConfig(
                "max_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.max_buffered_tokens == 0 {
            return Err(NoctuaError::InvalidConfig(
                "max_buffered_tokens must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolved kernel path: the override, or CPU detection.
    pub fn resolve_kernel_path(&self) -> KernelPath {
        self.kernel_path.unwrap_or_else(KernelPath::detect)
    }
}

/// Sampling pipeline parameters. Applied in the fixed order
/// temperature → top-k → softmax → min-p → top-p → multinomial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Logit divisor; 0.0 degenerates to greedy argmax.
    pub temperature: f32,
    /// Keep the k largest logits; 0 disables the filter.
    pub top_k: usize,
    /// Nucleus mass; 1.0 disables the filter.
    pub top_p: f32,
    /// Drop probabilities below `min_p · max_prob`; 0.0 disables.
    pub min_p: f32,
    /// PRNG seed. Identical seed, prompt and parameters reproduce the
    /// token sequence bit-identically.
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            min_p: 0.0,
            seed: 0,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> NoctuaResult<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(NoctuaError::InvalidConfig(format!(
                "temperature must be between 0.0 and 2.0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(NoctuaError::InvalidConfig(format!(
                "top_p must be between 0.0 and 1.0, got {}",
                self.top_p
            )));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return Err(NoctuaError::InvalidConfig(format!(
                "min_p must be between 0.0 and 1.0, got {}",
                self.min_p
            )));
        }
        Ok(())
    }

    /// Greedy mode: temperature of exactly zero.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.n_threads >= 1);
    }

    #[test]
    fn test_engine_config_rejects_zero_bounds() {
        let mut config = EngineConfig::default();
        config.kv_max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_queue_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sampling_params_validation() {
        assert!(SamplingParams::default().validate().is_ok());

        let bad = SamplingParams {
            temperature: 3.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = SamplingParams {
            top_p: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_greedy_detection() {
        let greedy = SamplingParams {
            temperature: 0.0,
            ..Default::default()
        };
        assert!(greedy.is_greedy());
        assert!(!SamplingParams::default().is_greedy());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_batch_size, config.max_batch_size);
        assert_eq!(back.kv_max_bytes, config.kv_max_bytes);
    }

    #[test]
    fn test_config_loads_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        let mut config = EngineConfig::default();
        config.kernel_path = Some(KernelPath::Scalar);
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded: EngineConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.kernel_path, Some(KernelPath::Scalar));
        assert!(loaded.validate().is_ok());
    }
}

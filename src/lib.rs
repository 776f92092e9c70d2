/// noctua: a self-contained CPU inference runtime for quantized
/// decoder-only transformer language models.
///
/// Given a parsed model (quantized weights + tokenizer) the runtime turns
/// a prompt into a completion token by token, deterministically when
/// seeded. Everything runs on the CPU: fused dequantize-and-multiply
/// matmul kernels with AVX2/FMA and portable fallbacks, a bounded
/// LRU-evicting KV cache, a linger-batching scheduler, and a
/// prefill/decode driver with a temperature → top-k → softmax → min-p →
/// top-p sampling pipeline.
///
/// Model-file parsing, tokenization internals, and every serving surface
/// (HTTP, CLI, formatters) live in external collaborators.
pub mod config;
pub mod error;
pub mod inference;
pub mod kernels;
pub mod logging;
pub mod model;
pub mod tensor;

pub use config::{EngineConfig, SamplingParams};
pub use error::{FinishReason, NoctuaError, NoctuaResult};
pub use inference::InferenceEngine;
pub use inference::driver::{Generation, GenerationOutput, GenerationRequest, StepOutcome};
pub use inference::kv_cache::{CacheStats, KvCacheStore, SessionId};
pub use inference::scheduler::{BatchScheduler, RequestHandle, SchedulerStats, TokenEvent};
pub use kernels::KernelPath;
pub use model::{ModelConfig, ModelHandle, TensorRef, Tokenizer};
pub use tensor::Tensor;
pub use tensor::quantized::{QuantFormat, QuantizedTensor};

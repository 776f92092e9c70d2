/// Inference runtime: KV cache, forward pass, sampling, driver, scheduler.
pub mod buffer_pool;
pub mod driver;
pub mod forward;
pub mod kv_cache;
pub mod rope;
pub mod sampling;
pub mod scheduler;
pub mod scratch;

use crate::config::EngineConfig;
use crate::error::NoctuaResult;
use crate::model::ModelHandle;
use buffer_pool::FloatBufferPool;
use driver::{Generation, GenerationOutput, GenerationRequest};
use forward::Transformer;
use kv_cache::{KvCacheStore, KvEntry, KvShape, SessionId};
use parking_lot::Mutex;
use std::sync::Arc;

/// The assembled runtime: immutable weights, the forward pass, and the
/// shared KV store. One engine serves any number of sessions; sessions are
/// externally owned and identified by id.
pub struct InferenceEngine {
    model: Arc<ModelHandle>,
    transformer: Transformer,
    kv: Arc<KvCacheStore>,
    pool: Arc<FloatBufferPool>,
    config: EngineConfig,
}

impl InferenceEngine {
    pub fn new(model: Arc<ModelHandle>, config: EngineConfig) -> NoctuaResult<Arc<Self>> {
        config.validate()?;
        let path = config.resolve_kernel_path();
        tracing::info!(
            model = %model.id,
            kernel = path.name(),
            blocks = model.config.block_count,
            "inference engine initialized"
        );

        let pool = FloatBufferPool::new();
        let kv = Arc::new(KvCacheStore::new(
            Arc::clone(&pool),
            config.kv_max_bytes,
            config.kv_max_entries,
        ));
        let transformer = Transformer::new(Arc::clone(&model), path);
        Ok(Arc::new(Self {
            model,
            transformer,
            kv,
            pool,
            config,
        }))
    }

    pub fn model(&self) -> &Arc<ModelHandle> {
        &self.model
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    pub fn kv_store(&self) -> &Arc<KvCacheStore> {
        &self.kv
    }

    pub fn buffer_pool(&self) -> &Arc<FloatBufferPool> {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// KV entry for a session, sized to the model's context budget.
    pub fn acquire_kv(&self, session: SessionId) -> NoctuaResult<Arc<Mutex<KvEntry>>> {
        let cfg = &self.model.config;
        self.kv.acquire(
            session,
            KvShape {
                layers: cfg.block_count,
                kv_heads: cfg.kv_head_count,
                head_dim: cfg.head_dim(),
                capacity: cfg.context_length,
            },
        )
    }

    /// Begin a generation for `session`; the caller drives it step by step
    /// (the scheduler does exactly this).
    pub fn start_generation(
        self: &Arc<Self>,
        session: SessionId,
        request: GenerationRequest,
    ) -> NoctuaResult<Generation> {
        Generation::new(Arc::clone(self), session, request)
    }

    /// Run one generation synchronously to completion.
    pub fn generate(
        self: &Arc<Self>,
        session: SessionId,
        request: GenerationRequest,
    ) -> NoctuaResult<GenerationOutput> {
        self.start_generation(session, request)?.run_to_completion()
    }
}

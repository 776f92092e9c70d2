/// Batch scheduler: coalesces concurrent requests into shared dispatches.
///
/// Requests enter a bounded FIFO queue (`QueueFull` past the depth limit).
/// A single background task forms batches of compatible requests (same
/// model, same context budget, same phase), waiting up to `linger_ms` for
/// a partial batch to fill, then dispatches the whole batch onto blocking
/// threads where each participant advances by one forward call. Output
/// tokens are demultiplexed onto per-request bounded channels: single
/// producer (this task), single consumer (the caller), with the channel
/// capacity as the backpressure bound.
///
/// Cancellation is a shared atomic flag, honored at batch boundaries: a
/// request cancelled while queued is removed before dispatch; one
/// cancelled mid-flight receives no further tokens and its channel closes
/// after a final `Finished(Cancelled)` event. Within one request, tokens
/// always arrive in generation order; across requests nothing is promised.
use super::InferenceEngine;
use super::driver::{GenerationRequest, Phase, StepOutcome};
use super::kv_cache::SessionId;
use crate::config::EngineConfig;
use crate::error::{FinishReason, NoctuaError, NoctuaResult};
use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, timeout_at};
use uuid::Uuid;

/// What a request's channel carries: its tokens in generation order, then
/// exactly one finish event before the channel closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEvent {
    Token(u32),
    Finished(FinishReason),
}

/// Caller's side of a submitted request.
pub struct RequestHandle {
    pub id: Uuid,
    pub events: mpsc::Receiver<TokenEvent>,
}

impl RequestHandle {
    /// Drain the channel: collected tokens plus the finish reason, if the
    /// scheduler delivered one before closing.
    pub async fn collect(mut self) -> (Vec<u32>, Option<FinishReason>) {
        let mut tokens = Vec::new();
        while let Some(event) = self.events.recv().await {
            match event {
                TokenEvent::Token(t) => tokens.push(t),
                TokenEvent::Finished(reason) => return (tokens, Some(reason)),
            }
        }
        (tokens, None)
    }
}

/// Batch compatibility fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CompatKey {
    model_id: String,
    context_budget: usize,
    phase: Phase,
}

struct ScheduledRequest {
    id: Uuid,
    generation: super::driver::Generation,
    events: mpsc::Sender<TokenEvent>,
    cancel: Arc<AtomicBool>,
    key: CompatKey,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    batches: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

/// Scheduler telemetry snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub rejected: u64,
    pub batches: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

pub struct BatchScheduler {
    engine: Arc<InferenceEngine>,
    queue: mpsc::Sender<ScheduledRequest>,
    cancels: Arc<DashMap<Uuid, Arc<AtomicBool>>>,
    counters: Arc<Counters>,
    task: tokio::task::JoinHandle<()>,
}

impl BatchScheduler {
    /// Spawn the scheduler task. Must be called inside a tokio runtime.
    pub fn new(engine: Arc<InferenceEngine>) -> Self {
        let config = engine.config().clone();
        let (tx, rx) = mpsc::channel(config.max_queue_depth);
        let cancels: Arc<DashMap<Uuid, Arc<AtomicBool>>> = Arc::new(DashMap::new());
        let counters = Arc::new(Counters::default());

        let task = tokio::spawn(run_loop(
            rx,
            config,
            Arc::clone(&cancels),
            Arc::clone(&counters),
        ));
        Self {
            engine,
            queue: tx,
            cancels,
            counters,
            task,
        }
    }

    /// Enqueue a generation. Fails with `QueueFull` past `max_queue_depth`.
    pub fn submit(
        &self,
        session: SessionId,
        request: GenerationRequest,
    ) -> NoctuaResult<RequestHandle> {
        let generation = self.engine.start_generation(session, request)?;
        let id = Uuid::new_v4();
        let cancel = generation.cancel_handle();
        let (events_tx, events_rx) = mpsc::channel(self.engine.config().max_buffered_tokens);
        let key = CompatKey {
            model_id: self.engine.model().id.clone(),
            context_budget: self.engine.model().config.context_length,
            phase: Phase::Prefill,
        };

        let scheduled = ScheduledRequest {
            id,
            generation,
            events: events_tx,
            cancel: Arc::clone(&cancel),
            key,
        };
        match self.queue.try_send(scheduled) {
            Ok(()) => {
                self.cancels.insert(id, cancel);
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(RequestHandle {
                    id,
                    events: events_rx,
                })
            }
            Err(TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(NoctuaError::QueueFull {
                    max_depth: self.engine.config().max_queue_depth,
                })
            }
            Err(TrySendError::Closed(_)) => Err(NoctuaError::Cancelled),
        }
    }

    /// Raise a request's cancellation flag. Returns false for unknown or
    /// already-finished requests.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.cancels.get(&id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting requests, drain in-flight work, and wait for the
    /// scheduler task to exit.
    pub async fn shutdown(self) {
        drop(self.queue);
        let _ = self.task.await;
    }
}

async fn run_loop(
    mut rx: mpsc::Receiver<ScheduledRequest>,
    config: EngineConfig,
    cancels: Arc<DashMap<Uuid, Arc<AtomicBool>>>,
    counters: Arc<Counters>,
) {
    let mut active: VecDeque<ScheduledRequest> = VecDeque::new();
    let mut holdover: Option<ScheduledRequest> = None;
    let mut open = true;

    while open || !active.is_empty() || holdover.is_some() {
        let mut batch: Vec<ScheduledRequest> = Vec::new();

        if !active.is_empty() {
            // continuation work first: these are all compatible decodes
            while batch.len() < config.max_batch_size {
                match active.pop_front() {
                    Some(r) => batch.push(r),
                    None => break,
                }
            }
        } else {
            let first = match holdover.take() {
                Some(r) => Some(r),
                None if open => match rx.recv().await {
                    Some(r) => Some(r),
                    None => {
                        open = false;
                        None
                    }
                },
                None => None,
            };
            let Some(first) = first else { continue };

            let deadline = Instant::now() + Duration::from_millis(config.linger_ms);
            batch.push(first);
            while open && batch.len() < config.max_batch_size {
                match timeout_at(deadline, rx.recv()).await {
                    Ok(Some(req)) if req.key == batch[0].key => batch.push(req),
                    Ok(Some(req)) => {
                        holdover = Some(req);
                        break;
                    }
                    Ok(None) => {
                        open = false;
                        break;
                    }
                    Err(_) => break, // linger elapsed
                }
            }
        }

        // cancelled while queued: removed before dispatch, no tokens sent
        let mut runnable = Vec::new();
        for request in batch {
            if request.cancel.load(Ordering::Acquire) {
                finish(&cancels, &counters, request, FinishReason::Cancelled).await;
            } else {
                runnable.push(request);
            }
        }
        if runnable.is_empty() {
            continue;
        }

        counters.batches.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(size = runnable.len(), "dispatching batch");

        // one dispatch: every participant advances by one forward call;
        // distinct sessions, so they may run in parallel
        let results = tokio::task::spawn_blocking(move || {
            runnable
                .into_par_iter()
                .map(|mut request| {
                    if request.cancel.load(Ordering::Acquire) {
                        return (request, Ok(StepOutcome::Finished(FinishReason::Cancelled)));
                    }
                    let outcome = request.generation.step();
                    (request, outcome)
                })
                .collect::<Vec<_>>()
        })
        .await
        .expect("batch worker panicked");

        for (mut request, outcome) in results {
            match outcome {
                Ok(StepOutcome::Token(token)) => {
                    if request.cancel.load(Ordering::Acquire) {
                        // cancelled mid-batch: no further tokens
                        finish(&cancels, &counters, request, FinishReason::Cancelled).await;
                        continue;
                    }
                    if request.events.send(TokenEvent::Token(token)).await.is_err() {
                        // consumer hung up; treat as cancellation
                        request.cancel.store(true, Ordering::Release);
                        cancels.remove(&request.id);
                        counters.cancelled.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    request.key.phase = Phase::Decode;
                    active.push_back(request);
                }
                Ok(StepOutcome::Finished(reason)) => {
                    finish(&cancels, &counters, request, reason).await;
                }
                Err(err) => {
                    tracing::warn!(id = %request.id, error = %err, "generation failed");
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    let _ = request
                        .events
                        .send(TokenEvent::Finished(FinishReason::Error))
                        .await;
                    cancels.remove(&request.id);
                }
            }
        }
    }
}

async fn finish(
    cancels: &DashMap<Uuid, Arc<AtomicBool>>,
    counters: &Counters,
    request: ScheduledRequest,
    reason: FinishReason,
) {
    let _ = request.events.send(TokenEvent::Finished(reason)).await;
    cancels.remove(&request.id);
    match reason {
        FinishReason::Cancelled => counters.cancelled.fetch_add(1, Ordering::Relaxed),
        _ => counters.completed.fetch_add(1, Ordering::Relaxed),
    };
    // dropping the request closes its channel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testmodel::{BYTE_EOS, transition_model};

    fn chain_engine(config: EngineConfig) -> Arc<InferenceEngine> {
        // 'a' -> 'b' -> 'c' -> 'd' -> EOS
        let model = transition_model(&[
            (b'a' as u32, b'b' as u32),
            (b'b' as u32, b'c' as u32),
            (b'c' as u32, b'd' as u32),
            (b'd' as u32, BYTE_EOS),
        ]);
        InferenceEngine::new(model, config).unwrap()
    }

    fn greedy_request(prompt: &str) -> GenerationRequest {
        let mut request = GenerationRequest::new(prompt.bytes().map(u32::from).collect());
        request.sampling.temperature = 0.0;
        request.max_output_tokens = 16;
        request
    }

    #[tokio::test]
    async fn test_tokens_arrive_in_generation_order() {
        let scheduler = BatchScheduler::new(chain_engine(EngineConfig::default()));
        let handle = scheduler.submit(1, greedy_request("a")).unwrap();
        let (tokens, reason) = handle.collect().await;
        assert_eq!(tokens, vec![b'b' as u32, b'c' as u32, b'd' as u32]);
        assert_eq!(reason, Some(FinishReason::Completed));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_all_complete() {
        let mut config = EngineConfig::default();
        config.max_batch_size = 2;
        config.linger_ms = 20;
        let scheduler = BatchScheduler::new(chain_engine(config));

        let handles: Vec<_> = (0..4)
            .map(|session| scheduler.submit(session, greedy_request("a")).unwrap())
            .collect();
        for handle in handles {
            let (tokens, reason) = handle.collect().await;
            assert_eq!(tokens.len(), 3);
            assert_eq!(reason, Some(FinishReason::Completed));
        }
        let stats = scheduler.stats();
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.completed, 4);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch() {
        let mut config = EngineConfig::default();
        config.max_batch_size = 2;
        config.linger_ms = 300;
        let scheduler = BatchScheduler::new(chain_engine(config));

        let h1 = scheduler.submit(1, greedy_request("a")).unwrap();
        let h2 = scheduler.submit(2, greedy_request("a")).unwrap();
        assert!(scheduler.cancel(h2.id));
        let h3 = scheduler.submit(3, greedy_request("a")).unwrap();

        let (t2, r2) = h2.collect().await;
        assert!(t2.is_empty(), "cancelled request must emit no tokens");
        assert_eq!(r2, Some(FinishReason::Cancelled));

        let (t1, r1) = h1.collect().await;
        assert_eq!(r1, Some(FinishReason::Completed));
        assert_eq!(t1.len(), 3);
        let (t3, r3) = h3.collect().await;
        assert_eq!(r3, Some(FinishReason::Completed));
        assert_eq!(t3.len(), 3);

        assert_eq!(scheduler.stats().cancelled, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_request() {
        let scheduler = BatchScheduler::new(chain_engine(EngineConfig::default()));
        assert!(!scheduler.cancel(Uuid::new_v4()));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_full_rejection() {
        let mut config = EngineConfig::default();
        config.max_queue_depth = 2;
        config.max_batch_size = 1;
        config.linger_ms = 0;
        config.max_buffered_tokens = 1;
        let scheduler = BatchScheduler::new(chain_engine(config));

        // the first request's consumer never reads, so once its channel
        // fills the scheduler blocks and the queue backs up
        let _parked = scheduler.submit(0, greedy_request("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut handles = Vec::new();
        let mut rejected = false;
        for session in 1..=8 {
            match scheduler.submit(session, greedy_request("a")) {
                Ok(h) => handles.push(h),
                Err(NoctuaError::QueueFull { max_depth }) => {
                    assert_eq!(max_depth, 2);
                    rejected = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert!(rejected, "queue never reported full");
        assert!(scheduler.stats().rejected >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_active_requests() {
        let scheduler = BatchScheduler::new(chain_engine(EngineConfig::default()));
        let handle = scheduler.submit(1, greedy_request("a")).unwrap();
        scheduler.shutdown().await;
        let (tokens, reason) = handle.collect().await;
        assert_eq!(tokens.len(), 3);
        assert_eq!(reason, Some(FinishReason::Completed));
    }
}

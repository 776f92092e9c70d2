/// Generation driver: the prefill/decode state machine.
///
/// A generation starts in prefill: the whole prompt goes through one
/// forward pass, the KV cache is written for every prompt position and the
/// last-position logits produce the first output token. It then settles
/// into decode: one token per pass at the current position.
///
/// Stop conditions are checked in a fixed order after every token: EOS,
/// stop strings on the decoded character stream, output length,
/// cancellation, wall-clock timeout. Every generation terminates with
/// exactly one finish reason. A forward-pass failure is fatal: the
/// session's KV entry is dropped before the error surfaces.
use super::InferenceEngine;
use super::kv_cache::{KvEntry, SessionId};
use super::sampling::Sampler;
use super::scratch::ScratchBuffers;
use crate::config::SamplingParams;
use crate::error::{FinishReason, NoctuaError, NoctuaResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Prompt token ids (already encoded by the caller's tokenizer).
    pub prompt: Vec<u32>,
    pub sampling: SamplingParams,
    pub max_output_tokens: usize,
    /// Stop strings, matched on the decoded character stream.
    pub stop_strings: Vec<String>,
    /// Wall-clock budget for the whole generation.
    pub timeout: Option<Duration>,
    /// Keep only the rightmost tokens that fit the context budget instead
    /// of failing with `ContextOverflow`.
    pub truncate_prompt: bool,
}

impl GenerationRequest {
    pub fn new(prompt: Vec<u32>) -> Self {
        Self {
            prompt,
            sampling: SamplingParams::default(),
            max_output_tokens: 256,
            stop_strings: Vec::new(),
            timeout: None,
            truncate_prompt: false,
        }
    }
}

/// Completed generation.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub tokens: Vec<u32>,
    /// Decoded text, truncated at the first completed stop string.
    pub text: String,
    pub finish_reason: FinishReason,
}

/// Result of driving the state machine one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Token(u32),
    Finished(FinishReason),
}

/// Which forward-pass shape the next step takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Prefill,
    Decode,
}

/// In-flight generation state. Owned by the caller (or the scheduler);
/// never shared across threads concurrently.
pub struct Generation {
    engine: Arc<InferenceEngine>,
    session: SessionId,
    prompt: Vec<u32>,
    sampler: Sampler,
    scratch: ScratchBuffers,
    kv: Arc<Mutex<KvEntry>>,
    phase: Phase,
    position: usize,
    last_token: u32,
    generated: Vec<u32>,
    stop_strings: Vec<String>,
    max_output: usize,
    deadline: Option<Instant>,
    cancel: Arc<AtomicBool>,
    finish: Option<FinishReason>,
    /// Char position in the decoded output where a stop string completed.
    stop_at: Option<usize>,
}

impl Generation {
    pub(crate) fn new(
        engine: Arc<InferenceEngine>,
        session: SessionId,
        request: GenerationRequest,
    ) -> NoctuaResult<Self> {
        request.sampling.validate()?;
        if request.prompt.is_empty() {
            return Err(NoctuaError::InvalidConfig(
                "prompt must contain at least one token".to_string(),
            ));
        }

        let context = engine.model().config.context_length;
        let mut prompt = request.prompt;
        let budget_needed = prompt.len() + request.max_output_tokens;
        if budget_needed > context {
            if request.truncate_prompt && request.max_output_tokens < context {
                let keep = context - request.max_output_tokens;
                let start = prompt.len() - keep.min(prompt.len());
                prompt.drain(..start);
            } else {
                return Err(NoctuaError::ContextOverflow {
                    budget: context,
                    required: budget_needed,
                });
            }
        }

        let kv = engine.acquire_kv(session)?;
        kv.lock().reset();

        let deadline = request.timeout.map(|t| Instant::now() + t);
        Ok(Self {
            engine,
            session,
            prompt,
            sampler: Sampler::new(request.sampling),
            scratch: ScratchBuffers::new(),
            kv,
            phase: Phase::Prefill,
            position: 0,
            last_token: 0,
            generated: Vec::new(),
            stop_strings: request.stop_strings,
            max_output: request.max_output_tokens,
            deadline,
            cancel: Arc::new(AtomicBool::new(false)),
            finish: None,
            stop_at: None,
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Shared flag the caller may raise to cancel between steps.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }

    /// Decoded output text, truncated at the first completed stop string.
    pub fn text(&self) -> String {
        let full = self.engine.model().tokenizer.decode(&self.generated);
        match self.stop_at {
            Some(at) => full.chars().take(at).collect(),
            None => full,
        }
    }

    pub fn tokens(&self) -> &[u32] {
        &self.generated
    }

    /// Advance by one forward pass and one sampled token.
    pub fn step(&mut self) -> NoctuaResult<StepOutcome> {
        if let Some(reason) = self.finish {
            return Ok(StepOutcome::Finished(reason));
        }
        if self.cancel.load(Ordering::Acquire) {
            return Ok(StepOutcome::Finished(self.finish_with(FinishReason::Cancelled)));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Ok(StepOutcome::Finished(self.finish_with(FinishReason::Timeout)));
            }
        }

        let (tokens, p0): (&[u32], usize) = match self.phase {
            Phase::Prefill => (&self.prompt, 0),
            Phase::Decode => (std::slice::from_ref(&self.last_token), self.position),
        };
        let t = tokens.len();

        let forward = {
            let mut entry = self.kv.lock();
            self.engine
                .transformer()
                .forward(tokens, p0, Some(&mut *entry), &mut self.scratch)
        };
        if let Err(err) = forward {
            tracing::warn!(session = self.session, error = %err, "forward pass failed");
            self.engine.kv_store().drop_session(self.session);
            self.finish = Some(FinishReason::Error);
            return Err(err);
        }

        let cfg = &self.engine.model().config;
        let logits = self.scratch.logits_row(cfg, t - 1);
        let token = self.sampler.sample(logits) as u32;

        self.position = p0 + t;
        self.phase = Phase::Decode;

        // stop conditions, in order
        if token == cfg.eos_token {
            return Ok(StepOutcome::Finished(self.finish_with(FinishReason::Completed)));
        }
        self.generated.push(token);
        self.last_token = token;

        if let Some(at) = self.find_stop() {
            self.stop_at = Some(at);
            return Ok(StepOutcome::Finished(self.finish_with(FinishReason::StopSequence)));
        }
        if self.generated.len() >= self.max_output {
            // the token still counts toward the output
            self.finish = Some(FinishReason::Length);
            return Ok(StepOutcome::Token(token));
        }
        if self.cancel.load(Ordering::Acquire) {
            self.finish = Some(FinishReason::Cancelled);
            return Ok(StepOutcome::Token(token));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.finish = Some(FinishReason::Timeout);
                return Ok(StepOutcome::Token(token));
            }
        }
        Ok(StepOutcome::Token(token))
    }

    /// Earliest character position where a stop string completes in the
    /// decoded output. Matching runs on the decoded stream, so a stop
    /// string split across token boundaries still fires.
    fn find_stop(&self) -> Option<usize> {
        if self.stop_strings.is_empty() {
            return None;
        }
        let text = self.engine.model().tokenizer.decode(&self.generated);
        self.stop_strings
            .iter()
            .filter_map(|stop| {
                text.find(stop.as_str())
                    .map(|byte_pos| text[..byte_pos].chars().count())
            })
            .min()
    }

    fn finish_with(&mut self, reason: FinishReason) -> FinishReason {
        self.finish = Some(reason);
        tracing::debug!(session = self.session, reason = %reason, "generation finished");
        reason
    }

    /// Drive the state machine to completion.
    pub fn run_to_completion(&mut self) -> NoctuaResult<GenerationOutput> {
        loop {
            match self.step()? {
                StepOutcome::Token(_) => continue,
                StepOutcome::Finished(reason) => {
                    return Ok(GenerationOutput {
                        tokens: self.generated.clone(),
                        text: self.text(),
                        finish_reason: reason,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::testmodel::{BYTE_EOS, transition_model};

    fn engine_with_transitions(transitions: &[(u32, u32)]) -> Arc<InferenceEngine> {
        InferenceEngine::new(transition_model(transitions), EngineConfig::default()).unwrap()
    }

    fn greedy_request(prompt: &str, max_tokens: usize) -> GenerationRequest {
        let mut request = GenerationRequest::new(prompt.bytes().map(u32::from).collect());
        request.sampling.temperature = 0.0;
        request.max_output_tokens = max_tokens;
        request
    }

    #[test]
    fn test_completed_on_eos() {
        // 'a' -> 'b' -> 'c' -> EOS
        let engine = engine_with_transitions(&[
            (b'a' as u32, b'b' as u32),
            (b'b' as u32, b'c' as u32),
            (b'c' as u32, BYTE_EOS),
        ]);
        let mut generation = Generation::new(engine, 1, greedy_request("a", 16)).unwrap();
        let output = generation.run_to_completion().unwrap();
        assert_eq!(output.finish_reason, FinishReason::Completed);
        assert_eq!(output.text, "bc");
    }

    #[test]
    fn test_length_finish() {
        // 'x' loops forever
        let engine = engine_with_transitions(&[(b'x' as u32, b'x' as u32)]);
        let mut generation = Generation::new(engine, 1, greedy_request("x", 5)).unwrap();
        let output = generation.run_to_completion().unwrap();
        assert_eq!(output.finish_reason, FinishReason::Length);
        assert_eq!(output.tokens.len(), 5);
        assert_eq!(output.text, "xxxxx");
    }

    #[test]
    fn test_stop_string_across_token_boundary() {
        // ':' -> '1' -> '\n' -> '\n' -> '\n' …: the two newlines of the
        // stop string arrive as separate tokens
        let engine = engine_with_transitions(&[
            (b':' as u32, b'1' as u32),
            (b'1' as u32, b'\n' as u32),
            (b'\n' as u32, b'\n' as u32),
        ]);
        let mut request = greedy_request("count:", 20);
        request.stop_strings = vec!["\n\n".to_string()];
        let mut generation = Generation::new(engine, 1, request).unwrap();
        let output = generation.run_to_completion().unwrap();
        assert_eq!(output.finish_reason, FinishReason::StopSequence);
        assert_eq!(output.text, "1");
    }

    #[test]
    fn test_cancellation_between_steps() {
        let engine = engine_with_transitions(&[(b'x' as u32, b'x' as u32)]);
        let mut generation = Generation::new(engine, 1, greedy_request("x", 100)).unwrap();
        let cancel = generation.cancel_handle();

        assert!(matches!(generation.step().unwrap(), StepOutcome::Token(_)));
        cancel.store(true, Ordering::Release);
        // the raised flag finishes the generation at the next boundary
        let outcome = generation.step().unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Finished(FinishReason::Cancelled) | StepOutcome::Token(_)
        ));
        assert_eq!(generation.finish_reason(), Some(FinishReason::Cancelled));
    }

    #[test]
    fn test_timeout_finish() {
        let engine = engine_with_transitions(&[(b'x' as u32, b'x' as u32)]);
        let mut request = greedy_request("x", 1000);
        request.timeout = Some(Duration::from_millis(0));
        let mut generation = Generation::new(engine, 1, request).unwrap();
        let output = generation.run_to_completion().unwrap();
        assert_eq!(output.finish_reason, FinishReason::Timeout);
    }

    #[test]
    fn test_context_overflow_before_work() {
        let engine = engine_with_transitions(&[]);
        let long_prompt: Vec<u32> = (0..60).map(|_| b'x' as u32).collect();
        let mut request = GenerationRequest::new(long_prompt);
        request.max_output_tokens = 30; // 60 + 30 > 64
        let result = Generation::new(engine, 1, request);
        assert!(matches!(result, Err(NoctuaError::ContextOverflow { .. })));
    }

    #[test]
    fn test_prompt_truncation_keeps_rightmost() {
        let engine = engine_with_transitions(&[
            (b'a' as u32, b'z' as u32),
            (b'z' as u32, BYTE_EOS),
        ]);
        // 60 'b's then one 'a'; truncation must keep the tail that ends in 'a'
        let mut prompt: Vec<u32> = vec![b'b' as u32; 60];
        prompt.push(b'a' as u32);
        let mut request = GenerationRequest::new(prompt);
        request.sampling.temperature = 0.0;
        request.max_output_tokens = 10;
        request.truncate_prompt = true;
        let mut generation = Generation::new(engine, 1, request).unwrap();
        let output = generation.run_to_completion().unwrap();
        assert_eq!(output.text, "z");
    }

    #[test]
    fn test_phase_transitions() {
        let engine = engine_with_transitions(&[(b'x' as u32, b'x' as u32)]);
        let mut generation = Generation::new(engine, 1, greedy_request("xx", 4)).unwrap();
        assert_eq!(generation.phase(), Phase::Prefill);
        generation.step().unwrap();
        assert_eq!(generation.phase(), Phase::Decode);
    }
}

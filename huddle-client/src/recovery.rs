//! Bounded retry of failed consume handshakes
//!
//! Each producer gets its own retry state: an attempt counter and a
//! cancellation token. The retry loop checks the token at every suspension
//! point, so a `producer-closed` notification stops a pending chain at once
//! instead of on its next iteration.

use async_trait::async_trait;
use huddle_proto::{ProducerId, TransportState};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::error::{ClientError, Result};
use crate::track::TrackId;

/// What the recovery loop operates on
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    /// Repair local state left behind by the failed attempt
    fn repair(&self, producer_id: &ProducerId);

    /// Current state of the receive transport; `Closed` once closed
    fn receive_transport_state(&self) -> TransportState;

    /// Run the full consume handshake once
    async fn consume(&self, producer_id: &ProducerId) -> Result<TrackId>;
}

struct RetryState {
    attempts: u32,
    generation: u64,
    token: CancellationToken,
}

pub struct RecoveryManager {
    config: RecoveryConfig,
    states: Mutex<HashMap<ProducerId, RetryState>>,
    generation: Mutex<u64>,
}

impl RecoveryManager {
    #[must_use]
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            generation: Mutex::new(0),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Delay before the attempt with zero-based index `attempt`:
    /// `base * 2^attempt * (1 + jitter)`, capped at `max_delay`
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self.config.base_delay_ms as f64 * 2f64.powi(attempt.min(30) as i32);
        let jitter = if self.config.jitter_ratio > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.config.jitter_ratio)
        } else {
            0.0
        };
        let delay_ms = (exponential * (1.0 + jitter)).min(self.config.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Retry the consume of `producer_id` after `original` failed it.
    ///
    /// Non-retryable errors are returned untouched without any attempt.
    /// Otherwise up to `max_attempts` handshakes are made; if all fail the
    /// result is [`ClientError::RetryExhausted`] wrapping `original`.
    pub async fn recover(
        &self,
        target: &dyn RecoveryTarget,
        producer_id: &ProducerId,
        original: ClientError,
    ) -> Result<TrackId> {
        if !original.is_retryable() {
            return Err(original);
        }

        let (generation, token) = self.register(producer_id);
        let result = self
            .run(target, producer_id, &token, generation, original)
            .await;
        self.forget(producer_id, generation);
        result
    }

    async fn run(
        &self,
        target: &dyn RecoveryTarget,
        producer_id: &ProducerId,
        token: &CancellationToken,
        generation: u64,
        original: ClientError,
    ) -> Result<TrackId> {
        loop {
            let Some(attempt) = self.next_attempt(producer_id, generation) else {
                if token.is_cancelled() {
                    return Err(ClientError::Cancelled(producer_id.clone()));
                }
                warn!(
                    producer_id = %producer_id,
                    attempts = self.config.max_attempts,
                    error = %original,
                    "Recovery exhausted"
                );
                return Err(ClientError::RetryExhausted {
                    producer_id: producer_id.clone(),
                    attempts: self.config.max_attempts,
                    source: Box::new(original),
                });
            };

            let delay = self.backoff_delay(attempt);
            info!(
                producer_id = %producer_id,
                attempt = attempt + 1,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Recovery attempt scheduled"
            );
            cancellable(token, producer_id, tokio::time::sleep(delay)).await?;

            target.repair(producer_id);

            let state = target.receive_transport_state();
            if state.is_unusable() {
                warn!(producer_id = %producer_id, %state, "Receive transport unusable, aborting recovery");
                return Err(ClientError::TransportUnhealthy(state));
            }

            cancellable(
                token,
                producer_id,
                tokio::time::sleep(self.config.stabilization_delay()),
            )
            .await?;

            match cancellable(token, producer_id, target.consume(producer_id)).await? {
                Ok(track_id) => {
                    info!(
                        producer_id = %producer_id,
                        attempts = attempt + 1,
                        track_id = %track_id,
                        "Recovery successful"
                    );
                    return Ok(track_id);
                }
                Err(e) if e.is_retryable() => {
                    warn!(producer_id = %producer_id, attempt = attempt + 1, error = %e, "Recovery attempt failed");
                }
                Err(e) => {
                    warn!(producer_id = %producer_id, error = %e, "Recovery stopped by non-retryable error");
                    return Err(e);
                }
            }
        }
    }

    /// Cancel a running recovery and clear its state.
    /// Returns true if one was running.
    pub fn cancel(&self, producer_id: &ProducerId) -> bool {
        let Some(state) = self.states.lock().remove(producer_id) else {
            return false;
        };
        state.token.cancel();
        info!(producer_id = %producer_id, attempts = state.attempts, "Recovery cancelled");
        true
    }

    /// Cancel every running recovery
    pub fn cancel_all(&self) {
        for (_, state) in self.states.lock().drain() {
            state.token.cancel();
        }
    }

    /// Attempts made so far for a running recovery; 0 when none is running
    #[must_use]
    pub fn attempts(&self, producer_id: &ProducerId) -> u32 {
        self.states
            .lock()
            .get(producer_id)
            .map_or(0, |state| state.attempts)
    }

    #[must_use]
    pub fn is_recovering(&self, producer_id: &ProducerId) -> bool {
        self.states.lock().contains_key(producer_id)
    }

    fn register(&self, producer_id: &ProducerId) -> (u64, CancellationToken) {
        let generation = {
            let mut generation = self.generation.lock();
            *generation += 1;
            *generation
        };
        let token = CancellationToken::new();
        let previous = self.states.lock().insert(
            producer_id.clone(),
            RetryState {
                attempts: 0,
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        (generation, token)
    }

    /// Reserve the next attempt. `None` once the budget is spent or the
    /// state was cancelled.
    fn next_attempt(&self, producer_id: &ProducerId, generation: u64) -> Option<u32> {
        let mut states = self.states.lock();
        let state = states
            .get_mut(producer_id)
            .filter(|state| state.generation == generation)?;
        if state.attempts >= self.config.max_attempts {
            return None;
        }
        let attempt = state.attempts;
        state.attempts += 1;
        Some(attempt)
    }

    fn forget(&self, producer_id: &ProducerId, generation: u64) {
        let mut states = self.states.lock();
        if states
            .get(producer_id)
            .is_some_and(|state| state.generation == generation)
        {
            states.remove(producer_id);
        }
    }
}

async fn cancellable<F: Future>(
    token: &CancellationToken,
    producer_id: &ProducerId,
    future: F,
) -> Result<F::Output> {
    tokio::select! {
        () = token.cancelled() => Err(ClientError::Cancelled(producer_id.clone())),
        output = future => Ok(output),
    }
}

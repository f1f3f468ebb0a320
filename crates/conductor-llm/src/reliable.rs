use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use conductor_core::errors::ProviderError;
use conductor_core::messages::Message;
use conductor_core::provider::{ChatOptions, ChunkStream, Provider};

/// Retry and circuit breaker settings for [`ReliableProvider`].
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Wraps a [`Provider`] with retries and a circuit breaker.
///
/// - Retryable errors are retried with exponential backoff + jitter
/// - `retry_after` hints from rate limit responses take precedence
/// - N consecutive failures open the circuit; after the cooldown one probe
///   request is let through (half-open) and a success closes it again
/// - Only the `chat()` call is retried. Once a stream has been handed out,
///   mid-stream failures go to the caller.
pub struct ReliableProvider<P: Provider> {
    inner: P,
    config: ReliableConfig,
    circuit_state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    total_retries: AtomicU64,
}

impl<P: Provider> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            circuit_state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn check_circuit(&self) -> Result<(), ProviderError> {
        let mut state = self.circuit_state.write();
        match *state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.circuit_breaker_cooldown {
                    info!(provider = self.inner.name(), "circuit breaker half-open");
                    *state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(ProviderError::Overloaded)
                }
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.circuit_state.write();
        if *state != CircuitState::Closed {
            info!(provider = self.inner.name(), "circuit breaker closed");
            *state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.circuit_state.write();
        let trip = match *state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => failures >= self.config.circuit_breaker_threshold,
            CircuitState::Open { .. } => false,
        };
        if trip {
            warn!(
                provider = self.inner.name(),
                failures,
                cooldown_secs = self.config.circuit_breaker_cooldown.as_secs(),
                "circuit breaker opened"
            );
            *state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }

        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        // delay * (1 ± jitter_factor)
        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (random_u64() % (jitter_range as u64 * 2 + 1)) as f64 - jitter_range;
        let final_ms = (capped + jitter).max(1.0);

        Duration::from_millis(final_ms as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        match *self.circuit_state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Non-cryptographic xorshift64, seeded per thread from the clock.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            (SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64)
                | 1
        );
    }

    STATE.with(|s| {
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

#[async_trait]
impl<P: Provider> Provider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ChunkStream, ProviderError> {
        self.check_circuit()?;

        let mut attempt = 0;
        loop {
            let err = match self.inner.chat(messages, options).await {
                Ok(stream) => {
                    self.record_success();
                    return Ok(stream);
                }
                Err(e) => e,
            };

            self.record_failure();
            if !err.is_retryable() || attempt >= self.config.max_retries {
                return Err(err);
            }

            let delay = self.retry_delay(attempt, err.suggested_delay());
            self.total_retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                provider = self.inner.name(),
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                kind = err.error_kind(),
                error = %err,
                "retrying after provider error"
            );

            tokio::time::sleep(delay).await;
            self.check_circuit()?;
            attempt += 1;
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        self.check_circuit()?;
        self.inner.list_models().await
    }
}

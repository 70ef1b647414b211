/*
 * RPG Scribe - Rust Edition
 * Copyright (c) 2024 RPG Scribe Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

//! Three composable resilience primitives shared by the STT and LLM
//! clients: bounded retry with exponential backoff, a per-downstream
//! circuit breaker, and a supervised reconnect loop for the upstream
//! voice adapter.
//!
//! The backoff formula (`min(base * exponential_base^n, max_delay)`) is
//! bit-specific per the design, so this is hand-rolled rather than built
//! on the `backoff` crate's policy objects.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ResilienceError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `n` (0-indexed retry, i.e. the delay before the
    /// *second* attempt overall is `delay_for(0)`).
    pub fn delay_for(&self, n: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.exponential_base.powi(n as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Runs `op` up to `config.max_attempts` times, sleeping between attempts
/// per [`RetryConfig::delay_for`]. `on_retry` fires with the 0-indexed
/// retry count and the error before each sleep. Surfaces the last error
/// once attempts are exhausted.
pub async fn retry<T, E, F, Fut>(
    config: &RetryConfig,
    mut on_retry: impl FnMut(u32, &E),
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= config.max_attempts {
                    return Err(err);
                }
                on_retry(attempt - 1, &err);
                tokio::time::sleep(config.delay_for(attempt - 1)).await;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// Tri-state breaker guarding a single named downstream. `Open -> HalfOpen`
/// is computed lazily on the next `call`, not via a background timer.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Runs `op` if the circuit allows it; rejects with `CircuitOpen`
    /// without invoking `op` otherwise.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == CircuitState::Open {
                let elapsed = inner
                    .last_failure_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = 0;
                } else {
                    return Err(ResilienceError::CircuitOpen(self.name.clone()));
                }
            }
            if inner.state == CircuitState::HalfOpen {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    return Err(ResilienceError::CircuitOpen(self.name.clone()));
                }
                inner.half_open_in_flight += 1;
            }
        }

        match op().await {
            Ok(value) => {
                let mut inner = self.inner.lock().await;
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.half_open_in_flight = 0;
                Ok(value)
            }
            Err(err) => {
                let mut inner = self.inner.lock().await;
                inner.consecutive_failures += 1;
                inner.last_failure_at = Some(Instant::now());
                inner.half_open_in_flight = 0;
                if inner.state == CircuitState::HalfOpen
                    || inner.consecutive_failures >= self.config.failure_threshold
                {
                    inner.state = CircuitState::Open;
                }
                Err(ResilienceError::Operation(err))
            }
        }
    }
}

/// Wraps `connect`/`disconnect`/`is_connected` and runs a background
/// monitor that polls connectivity and drives an independent
/// exponential-backoff reconnect loop when it drops. `stop` is idempotent
/// under concurrent or repeated calls.
pub struct SupervisedReconnect {
    cancel: CancellationToken,
    monitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    started: AtomicU64,
}

impl Default for SupervisedReconnect {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisedReconnect {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            monitor: Mutex::new(None),
            started: AtomicU64::new(0),
        }
    }

    /// Invokes `connect` once, then spawns a monitor task polling
    /// `is_connected` every 5s; on disconnect it retries `connect` with
    /// exponential backoff up to `max_attempts`.
    pub async fn start<C, D, I, Fut, DFut, IFut>(
        self: &Arc<Self>,
        connect: C,
        disconnect: D,
        is_connected: I,
        retry_config: RetryConfig,
    ) -> anyhow::Result<()>
    where
        C: Fn() -> Fut + Send + Sync + 'static,
        D: Fn() -> DFut + Send + Sync + 'static,
        I: Fn() -> IFut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
        DFut: Future<Output = ()> + Send,
        IFut: Future<Output = bool> + Send,
    {
        if self.started.swap(1, Ordering::SeqCst) == 1 {
            return Ok(());
        }
        connect().await?;

        let cancel = self.cancel.clone();
        let failures = Arc::new(AtomicU32::new(0));
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {},
                }
                if is_connected().await {
                    continue;
                }
                tracing::warn!("upstream connection lost, attempting supervised reconnect");
                let mut attempt = 0u32;
                loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    match connect().await {
                        Ok(()) => {
                            failures.store(0, Ordering::SeqCst);
                            break;
                        }
                        Err(err) => {
                            attempt += 1;
                            tracing::error!(attempt, error = %err, "reconnect attempt failed");
                            if attempt >= retry_config.max_attempts {
                                tracing::error!("supervised reconnect exhausted attempts, giving up");
                                break;
                            }
                            tokio::time::sleep(retry_config.delay_for(attempt - 1)).await;
                        }
                    }
                }
            }
            disconnect().await;
        });

        *self.monitor.lock().await = Some(handle);
        Ok(())
    }

    /// Cancels the monitor and is safe to call repeatedly, or on a
    /// never-started instance.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.monitor.lock().await.take() {
            let _ = handle.await;
        }
    }
}

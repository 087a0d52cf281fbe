// =============================================================================
// Circuit breaker — three states with a strict single-probe half-open
// =============================================================================
//
// CLOSED    calls pass; failures count; threshold trips to OPEN.
// OPEN      calls fail fast. The first call after the recovery timeout
//           atomically becomes the probe (state -> HALF_OPEN).
// HALF_OPEN exactly one probe is in flight; every other caller fails fast
//           with "probe in progress". Probe success closes the circuit,
//           probe failure re-opens it and restarts the recovery clock.
//
// The classic half-open that admits unbounded probes amplifies the outage;
// the canary guarantees at most one client observes the failure per
// recovery window.
//
// Synchronous vendor calls are routed through ThreadOffload via
// `call_blocking`; async callables use `call`. The state machine is shared.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::core::offload::ThreadOffload;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
    last_error: String,
}

pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                probe_in_flight: false,
                last_error: String::new(),
            }),
        }
    }

    /// Breaker guarding order placement: 3 failures, 30s recovery.
    pub fn for_broker() -> Self {
        Self::new("broker", 3, Duration::from_secs(30))
    }

    /// Breaker guarding read paths (positions, limits): 5 failures, 60s.
    pub fn for_positions() -> Self {
        Self::new("positions", 5, Duration::from_secs(60))
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run an async operation under the breaker.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        self.admit()?;
        let result = op().await;
        self.settle(result)
    }

    /// Run a blocking vendor-SDK call under the breaker, offloaded.
    pub async fn call_blocking<T, F>(
        &self,
        offload: &ThreadOffload,
        op: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        self.admit()?;
        let result = match offload.submit(op).await {
            Ok(inner) => inner,
            Err(e) => Err(e),
        };
        self.settle(result)
    }

    // ── State machine ───────────────────────────────────────────────────

    /// Decide whether this call may proceed. In OPEN, the first caller past
    /// the recovery timeout claims the probe slot under the same lock, so
    /// exactly one probe can ever be in flight.
    fn admit(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Err(EngineError::CircuitOpen {
                name: self.name,
                detail: "probe in progress".into(),
            }),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(self.recovery_timeout);
                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    warn!(breaker = self.name, "probe active: allowing one call to test recovery");
                    Ok(())
                } else {
                    let remaining = self.recovery_timeout - elapsed;
                    Err(EngineError::CircuitOpen {
                        name: self.name,
                        detail: format!(
                            "retry in {:.1}s (last error: {})",
                            remaining.as_secs_f64(),
                            inner.last_error
                        ),
                    })
                }
            }
        }
    }

    /// Apply the call outcome to the state machine. Control-flow errors
    /// (risk denial, shutdown) mean the service answered and are treated as
    /// success for breaker purposes.
    fn settle<T>(&self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        match &result {
            Ok(_) => self.on_success(),
            Err(e) if e.counts_as_breaker_failure() => self.on_failure(&e.to_string()),
            Err(_) => self.on_success(),
        }
        result
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = self.name, "circuit closed, service recovered");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
        inner.probe_in_flight = false;
    }

    fn on_failure(&self, msg: &str) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_error = msg.to_string();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.probe_in_flight = false;
                error!(breaker = self.name, error = msg, "probe failed, circuit re-opened");
            }
            CircuitState::Closed => {
                if inner.failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    error!(
                        breaker = self.name,
                        failures = inner.failures,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("failures", &inner.failures)
            .finish()
    }
}

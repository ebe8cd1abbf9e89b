//! Per-server circuit breakers.
//!
//! Tracks consecutive failures per downstream server and rejects calls
//! immediately once the failure threshold is exceeded, until a cooldown
//! elapses. The first call after the cooldown is a single half-open probe:
//! success closes the circuit, failure re-opens it and restarts the
//! cooldown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use toolgate_error::GatewayError;

/// Configuration for one circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long to wait before probing a tripped circuit.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// The observable state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// One probe call is in flight.
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// A circuit breaker for one downstream server.
pub struct CircuitBreaker {
    server: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Whether an error counts against the breaker.
///
/// Only downstream faults count; admission rejections and caller-side
/// cancellation never trip a circuit.
fn counts_as_failure(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::Downstream { .. } | GatewayError::Internal(_)
    )
}

enum Admission {
    Pass,
    Probe,
}

impl CircuitBreaker {
    fn new(server: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            server: server.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// The breaker's current state.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// The current consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .expect("breaker lock poisoned")
            .consecutive_failures
    }

    fn admit(&self) -> Result<Admission, GatewayError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(Admission::Pass),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(server = %self.server, "circuit half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(GatewayError::CircuitOpen {
                        server: self.server.clone(),
                        retry_in_ms: (self.config.cooldown - elapsed).as_millis() as u64,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(GatewayError::CircuitOpen {
                        server: self.server.clone(),
                        retry_in_ms: 0,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    fn record(&self, probe: bool, failed: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if probe {
            inner.probe_in_flight = false;
        }
        if failed {
            inner.consecutive_failures += 1;
            inner.opened_at = Some(Instant::now());
            if probe {
                inner.state = BreakerState::Open;
                tracing::warn!(server = %self.server, "circuit re-opened after failed probe");
            } else if inner.consecutive_failures >= self.config.failure_threshold {
                if inner.state != BreakerState::Open {
                    tracing::warn!(
                        server = %self.server,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
                inner.state = BreakerState::Open;
            }
        } else {
            if probe {
                tracing::info!(server = %self.server, "circuit closed after successful probe");
            }
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
        }
    }

    /// Release a probe slot without counting an outcome. The circuit returns
    /// to open with its original `opened_at`, so the next probe is admitted
    /// as soon as a caller arrives.
    fn abandon_probe(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.probe_in_flight {
            inner.probe_in_flight = false;
            if inner.state == BreakerState::HalfOpen {
                inner.state = BreakerState::Open;
            }
        }
    }
}

/// Releases an abandoned probe slot if the wrapped future is dropped before
/// completing, so a cancelled probe cannot wedge the breaker half-open.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_probe();
        }
    }
}

/// Registry of circuit breakers, one per downstream server, created lazily.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create a registry with a default config and optional per-server
    /// overrides.
    pub fn new(default_config: BreakerConfig, overrides: HashMap<String, BreakerConfig>) -> Self {
        Self {
            default_config,
            overrides,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for a server.
    pub fn breaker_for(&self, server: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry lock poisoned");
        breakers
            .entry(server.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(server)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(CircuitBreaker::new(server, config))
            })
            .clone()
    }

    /// Fast admission check without running anything: fails with
    /// `circuit-open` while the server's circuit is open and still cooling
    /// down. Does not consume the half-open probe slot.
    pub fn check(&self, server: &str) -> Result<(), GatewayError> {
        let breaker = self.breaker_for(server);
        let inner = breaker.inner.lock().expect("breaker lock poisoned");
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                let elapsed = opened_at.elapsed();
                if elapsed < breaker.config.cooldown {
                    return Err(GatewayError::CircuitOpen {
                        server: server.to_string(),
                        retry_in_ms: (breaker.config.cooldown - elapsed).as_millis() as u64,
                    });
                }
            }
        }
        Ok(())
    }

    /// Run `fut` under the server's breaker.
    ///
    /// Fails fast with `circuit-open` when the breaker rejects admission.
    /// Only downstream faults count toward opening the circuit; typed
    /// admission errors and shutdown cancellation pass through uncounted.
    pub async fn execute<T, F>(&self, server: &str, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let breaker = self.breaker_for(server);
        let admission = breaker.admit()?;
        let probe = matches!(admission, Admission::Probe);

        let mut guard = ProbeGuard {
            breaker: &*breaker,
            armed: probe,
        };

        let result = fut.await;
        guard.armed = false;

        match &result {
            Ok(_) => breaker.record(probe, false),
            Err(e) if counts_as_failure(e) => breaker.record(probe, true),
            // Neutral outcome (admission rejection, cancellation): no count
            // change, but a probe slot must be released.
            Err(_) => breaker.abandon_probe(),
        }

        result
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default(), HashMap::new())
    }
}

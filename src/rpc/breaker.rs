//! Circuit breaker gating wire calls to the node. Repeated transport
//! failures open the circuit for a cooldown; a single half-open probe
//! closes it again on success.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct RpcBreaker {
    state: Arc<Mutex<BreakerState>>,
    failure_threshold: usize,
    cooldown: Duration,
}

impl Default for RpcBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

impl RpcBreaker {
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BreakerState {
                phase: BreakerPhase::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            })),
            failure_threshold: failure_threshold.max(1),
            cooldown: cooldown.max(Duration::from_millis(1)),
        }
    }

    pub fn phase(&self) -> BreakerPhase {
        self.lock().phase
    }

    /// Decides whether a new wire call may proceed, reserving the
    /// half-open probe slot when the cooldown has elapsed.
    pub fn before_request(&self) -> Result<(), super::RpcError> {
        let mut state = self.lock();

        if state.phase == BreakerPhase::Open {
            let cooled = state
                .opened_at
                .map(|opened| opened.elapsed() >= self.cooldown)
                .unwrap_or(false);
            if !cooled {
                return Err(super::RpcError::CircuitOpen);
            }
            state.phase = BreakerPhase::HalfOpen;
            state.probe_in_flight = false;
            tracing::debug!("rpc circuit breaker half-open; allowing a probe");
        }

        if state.phase == BreakerPhase::HalfOpen {
            if state.probe_in_flight {
                return Err(super::RpcError::CircuitOpen);
            }
            state.probe_in_flight = true;
        }

        Ok(())
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.phase != BreakerPhase::Closed {
            tracing::info!("rpc circuit breaker closed after successful probe");
        }
        state.phase = BreakerPhase::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        state.probe_in_flight = false;

        let reopen = state.phase == BreakerPhase::HalfOpen
            || (state.phase == BreakerPhase::Closed
                && state.consecutive_failures >= self.failure_threshold);
        if reopen {
            state.phase = BreakerPhase::Open;
            state.opened_at = Some(Instant::now());
            tracing::warn!(
                consecutive_failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "rpc circuit breaker opened"
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().expect("rpc breaker mutex poisoned")
    }
}

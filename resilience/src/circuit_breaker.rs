//! Circuit breaker pattern per downstream dependency

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Closed (normal operation)
    Closed,
    /// Open (rejecting requests)
    Open,
    /// Half-open (one probe allowed)
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by gauges (0=closed, 1=half-open, 2=open)
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Window the consecutive failures must fall in (milliseconds)
    pub failure_window_ms: u64,
    /// Time spent open before a probe is admitted (milliseconds)
    pub cool_down_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::DEFAULT_CB_FAILURE_THRESHOLD,
            failure_window_ms: crate::DEFAULT_CB_FAILURE_WINDOW_MS,
            cool_down_ms: crate::DEFAULT_CB_COOL_DOWN_MS,
        }
    }
}

/// Read-only view of one breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Failures in the current streak
    pub consecutive_failures: u32,
    /// When the circuit last opened
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    streak_started: Option<Instant>,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            streak_started: None,
            opened_at: None,
            opened_at_wall: None,
            probe_in_flight: false,
            config,
        }
    }

    fn try_acquire(&mut self, dependency: &str) -> Result<()> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cool_down = Duration::from_millis(self.config.cool_down_ms);
                let elapsed = self.opened_at.map(|at| at.elapsed()).unwrap_or(cool_down);

                if elapsed >= cool_down {
                    info!(dependency, "Circuit breaker half-opening");
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        dependency: dependency.to_string(),
                        retry_in_ms: (cool_down - elapsed).as_millis() as u64,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Err(Error::CircuitOpen {
                        dependency: dependency.to_string(),
                        retry_in_ms: 0,
                    })
                } else {
                    self.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn record_success(&mut self, dependency: &str) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.streak_started = None;
            }
            CircuitState::HalfOpen => {
                info!(dependency, "Circuit breaker closing after successful probe");
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.streak_started = None;
                self.opened_at = None;
                self.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&mut self, dependency: &str) {
        let now = Instant::now();

        match self.state {
            CircuitState::Closed => {
                let window = Duration::from_millis(self.config.failure_window_ms);
                match self.streak_started {
                    Some(started) if now.duration_since(started) <= window => {
                        self.consecutive_failures += 1;
                    }
                    _ => {
                        self.streak_started = Some(now);
                        self.consecutive_failures = 1;
                    }
                }

                if self.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        dependency,
                        failures = self.consecutive_failures,
                        "Circuit breaker opening"
                    );
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(dependency, "Circuit breaker re-opening after failed probe");
                self.consecutive_failures += 1;
                self.open(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Outcome that says nothing about the dependency's health
    fn record_ignored(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.opened_at_wall = Some(Utc::now());
        self.probe_in_flight = false;
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at_wall,
        }
    }
}

/// Admission granted by a breaker. The holder must settle it with exactly one
/// outcome; an unsettled permit counts as a failure when dropped.
#[derive(Debug)]
pub struct Permit {
    breaker: Arc<Mutex<CircuitBreaker>>,
    dependency: String,
    settled: bool,
}

impl Permit {
    /// The call succeeded
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.lock().record_success(&self.dependency);
    }

    /// The call failed in a way attributable to the dependency
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.lock().record_failure(&self.dependency);
    }

    /// The call failed for a reason unrelated to the dependency's health
    pub fn ignore(mut self) {
        self.settled = true;
        self.breaker.lock().record_ignored();
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.lock().record_failure(&self.dependency);
        }
    }
}

/// Circuit breakers keyed by dependency name. Each breaker has its own lock,
/// so unrelated dependencies never contend.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<Mutex<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    /// Create new registry
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    fn breaker(&self, dependency: &str) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(existing) = self.breakers.get(dependency) {
            return existing.clone();
        }
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(self.config.clone()))))
            .clone()
    }

    /// Ask to call `dependency`; fails fast while the circuit is open
    pub fn try_acquire(&self, dependency: &str) -> Result<Permit> {
        let breaker = self.breaker(dependency);
        breaker.lock().try_acquire(dependency)?;
        Ok(Permit {
            breaker,
            dependency: dependency.to_string(),
            settled: false,
        })
    }

    /// Current state (Closed for never-seen dependencies)
    pub fn state(&self, dependency: &str) -> CircuitState {
        self.snapshot(dependency).state
    }

    /// Read-only snapshot
    pub fn snapshot(&self, dependency: &str) -> BreakerSnapshot {
        self.breakers
            .get(dependency)
            .map(|b| b.lock().snapshot())
            .unwrap_or(BreakerSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            })
    }

    /// Names of all dependencies seen so far
    pub fn dependencies(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn config(threshold: u32, cool_down_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            failure_window_ms: 60_000,
            cool_down_ms,
        }
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let registry = BreakerRegistry::new(config(3, 60_000));

        for _ in 0..3 {
            registry.try_acquire("sanctions").unwrap().failure();
        }

        assert_eq!(registry.state("sanctions"), CircuitState::Open);
        assert!(matches!(
            registry.try_acquire("sanctions"),
            Err(Error::CircuitOpen { .. })
        ));

        // Other dependencies unaffected
        assert!(registry.try_acquire("kyc").is_ok());
    }

    #[test]
    fn test_success_resets_streak() {
        let registry = BreakerRegistry::new(config(3, 60_000));

        registry.try_acquire("aml").unwrap().failure();
        registry.try_acquire("aml").unwrap().failure();
        registry.try_acquire("aml").unwrap().success();
        registry.try_acquire("aml").unwrap().failure();

        let snapshot = registry.snapshot("aml");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 1);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let registry = BreakerRegistry::new(config(1, 20));
        registry.try_acquire("dep").unwrap().failure();
        assert_eq!(registry.state("dep"), CircuitState::Open);

        sleep(Duration::from_millis(30));

        let probe = registry.try_acquire("dep").expect("probe admitted after cool-down");
        assert_eq!(registry.state("dep"), CircuitState::HalfOpen);
        assert!(registry.try_acquire("dep").is_err());

        probe.success();
        assert_eq!(registry.state("dep"), CircuitState::Closed);
        assert!(registry.try_acquire("dep").is_ok());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let registry = BreakerRegistry::new(config(1, 20));
        registry.try_acquire("dep").unwrap().failure();
        sleep(Duration::from_millis(30));

        registry.try_acquire("dep").unwrap().failure();
        assert_eq!(registry.state("dep"), CircuitState::Open);
        assert!(registry.try_acquire("dep").is_err());
    }

    #[test]
    fn test_dropped_permit_counts_as_failure() {
        let registry = BreakerRegistry::new(config(1, 60_000));
        {
            let _permit = registry.try_acquire("dep").unwrap();
        }
        assert_eq!(registry.state("dep"), CircuitState::Open);
    }

    #[test]
    fn test_ignored_probe_keeps_half_open() {
        let registry = BreakerRegistry::new(config(1, 20));
        registry.try_acquire("dep").unwrap().failure();
        sleep(Duration::from_millis(30));

        registry.try_acquire("dep").unwrap().ignore();
        assert_eq!(registry.state("dep"), CircuitState::HalfOpen);
        assert!(registry.try_acquire("dep").is_ok());
    }
}

use std::time::Duration;

use tracing::debug;

/// Backoff parameters
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    /// Cap on the exponential part of the delay
    pub max_delay: Duration,
    /// Width of the uniform random delay added on top
    pub jitter: Duration,
    /// Consecutive failed attempts before giving up (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            jitter: Duration::from_millis(250),
            max_attempts: 6,
        }
    }
}

/// Reconnect bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    /// Attempts since the last successful open
    pub attempt: u32,
    /// A reconnect is scheduled or executing
    pub in_flight: bool,
    pub last_error: Option<String>,
}

/// Outcome of reporting a transport failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Re-open after `delay`
    Schedule { attempt: u32, delay: Duration },
    /// Another reconnect is already scheduled or executing
    AlreadyInFlight,
    /// Stop was requested; do nothing
    StopRequested,
    /// The attempt budget is spent
    Exhausted { attempts: u32 },
}

/// Exponential backoff with jitter, at most one reconnect in flight.
///
/// `delay = min(max_delay, base_delay * 2^(attempt - 1)) + uniform(0, jitter)`
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    state: ReconnectState,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ReconnectState::default(),
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub fn state(&self) -> &ReconnectState {
        &self.state
    }

    /// Exponential part of the delay for `attempt` (1-based), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    /// Full delay for `attempt` given a jitter sample in [0, 1)
    pub fn delay_for(&self, attempt: u32, jitter_sample: f64) -> Duration {
        self.backoff(attempt) + self.config.jitter.mul_f64(jitter_sample.clamp(0.0, 1.0))
    }

    /// Report a transport error or unexpected close
    pub fn on_failure(&mut self, error: impl Into<String>, stop_requested: bool) -> ReconnectDecision {
        self.on_failure_with_jitter(error, stop_requested, rand::random::<f64>())
    }

    /// `on_failure` with an explicit jitter sample in [0, 1)
    pub fn on_failure_with_jitter(
        &mut self,
        error: impl Into<String>,
        stop_requested: bool,
        jitter_sample: f64,
    ) -> ReconnectDecision {
        let error = error.into();

        if stop_requested {
            debug!("Not reconnecting after '{}': stop requested", error);
            return ReconnectDecision::StopRequested;
        }

        if self.state.in_flight {
            debug!("Not reconnecting after '{}': attempt already in flight", error);
            return ReconnectDecision::AlreadyInFlight;
        }

        self.state.last_error = Some(error);

        if self.config.max_attempts > 0 && self.state.attempt >= self.config.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts: self.state.attempt,
            };
        }

        self.state.attempt += 1;
        self.state.in_flight = true;

        ReconnectDecision::Schedule {
            attempt: self.state.attempt,
            delay: self.delay_for(self.state.attempt, jitter_sample),
        }
    }

    /// The executing attempt failed; a new failure may schedule again
    pub fn finish_attempt(&mut self) {
        self.state.in_flight = false;
    }

    /// A transport opened successfully
    pub fn on_opened(&mut self) {
        self.state = ReconnectState::default();
    }

    /// Drop any pending attempt without touching the counter
    pub fn cancel(&mut self) {
        self.state.in_flight = false;
    }

    /// Start over, as after a user-initiated retry
    pub fn reset(&mut self) {
        self.state = ReconnectState::default();
    }
}

//! The typing state machine.
//!
//! [`TypingMachine::on_wake`] is the whole per-wake algorithm. It is pure with
//! respect to time: the caller passes `now` and whether the wake came from a
//! signal, and gets back what to reveal and how long to wait. The scheduler
//! thread runs it under the stream lock; tests run it with a
//! [`ManualClock`](super::ManualClock).
//!
//! # Pacing
//!
//! ```text
//! steady state     delay = max(base / remaining, previous * damping)
//! finishing burst  delay = previous * damping
//! ```
//!
//! A deep backlog types fast because the base budget is split across it. The
//! `previous * damping` floor keeps the rate from jumping: each delay is at
//! least a fixed fraction of the one before.

use std::time::{Duration, Instant};

use super::state::{StreamState, TypingPhase};

/// Tunables for the typing engine
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TypingConfig {
    /// Time budget split across the current backlog
    pub base_time: Duration,
    /// Factor applied to the previous delay, in (0, 1)
    pub damping: f64,
    /// Give up on a producer that sends nothing for this long (None = wait forever)
    pub stall_timeout: Option<Duration>,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            base_time: Duration::from_millis(200),
            damping: 0.9,
            stall_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl TypingConfig {
    /// Create a config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base time budget
    #[must_use]
    pub fn with_base_time(mut self, base_time: Duration) -> Self {
        self.base_time = base_time;
        self
    }

    /// Set the damping factor
    #[must_use]
    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    /// Set (or disable) the stall timeout
    #[must_use]
    pub fn with_stall_timeout(mut self, stall_timeout: Option<Duration>) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }
}

/// How the scheduler should block after a wake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Until the next signal
    Indefinite,
    /// Until the deadline or the next signal, whichever comes first
    Until(Instant),
}

/// Text handed to the display sink
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reveal {
    /// One character, or a whole flush
    pub text: String,
    /// Last reveal of the generation
    pub is_terminal: bool,
}

/// Result of one wake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WakeOutcome {
    /// Text to reveal, if any
    pub reveal: Option<Reveal>,
    /// Failure to report after a terminal reveal
    pub failure: Option<String>,
    /// Next wait
    pub wait: Wait,
}

impl WakeOutcome {
    fn waiting(wait: Wait) -> Self {
        Self {
            reveal: None,
            failure: None,
            wait,
        }
    }
}

/// Scheduler-private timing state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacingState {
    /// Per-character delay chosen after the last reveal (or retarget)
    pub delay: Option<Duration>,
    /// When the last character was revealed
    pub last_reveal_at: Option<Instant>,
    /// When the next character is due
    pub deadline: Option<Instant>,
}

/// Per-wake decision logic for the typing scheduler
#[derive(Debug)]
pub struct TypingMachine {
    config: TypingConfig,
    pacing: PacingState,
}

impl TypingMachine {
    /// Create a machine with the given tunables
    #[must_use]
    pub fn new(config: TypingConfig) -> Self {
        Self {
            config,
            pacing: PacingState::default(),
        }
    }

    /// Tunables in use
    #[must_use]
    pub fn config(&self) -> &TypingConfig {
        &self.config
    }

    /// Current timing state
    #[must_use]
    pub fn pacing(&self) -> &PacingState {
        &self.pacing
    }

    /// Run one wake against the locked stream state
    ///
    /// `signaled` is true when the wake came from the producer or the abort
    /// handler rather than from the deadline passing.
    pub fn on_wake(&mut self, state: &mut StreamState, signaled: bool, now: Instant) -> WakeOutcome {
        if state.is_aborting() || state.phase() == TypingPhase::Flushing {
            return self.flush(state);
        }

        if signaled {
            if let Some(deadline) = self.pacing.deadline {
                if now < deadline && state.pending_len() > 0 {
                    return self.retarget(state, deadline, now);
                }
            }
        }

        self.type_next(state, now)
    }

    /// Reveal everything buffered in one go.
    ///
    /// Flush mode sticks until the final fragment has been flushed.
    fn flush(&mut self, state: &mut StreamState) -> WakeOutcome {
        state.clear_abort();
        self.pacing = PacingState::default();
        let text = state.drain_pending();

        if state.is_complete() {
            tracing::debug!(len = text.len(), "Final flush after abort");
            return self.finish(state, text);
        }

        state.set_phase(TypingPhase::Flushing);
        WakeOutcome {
            reveal: (!text.is_empty()).then_some(Reveal {
                text,
                is_terminal: false,
            }),
            failure: None,
            wait: Wait::Indefinite,
        }
    }

    /// A fragment landed mid-delay: move the deadline, reveal nothing.
    fn retarget(&mut self, state: &StreamState, deadline: Instant, now: Instant) -> WakeOutcome {
        if state.is_complete() {
            // The finishing burst starts at the next reveal.
            return WakeOutcome::waiting(Wait::Until(deadline));
        }

        let delay = self.backlog_delay(state.pending_len());
        let anchor = self.pacing.last_reveal_at.unwrap_or(now);
        let deadline = anchor + delay;
        self.pacing.delay = Some(delay);
        self.pacing.deadline = Some(deadline);

        tracing::trace!(
            remaining = state.pending_len(),
            delay_us = delay.as_micros() as u64,
            "Retargeted typing delay"
        );
        WakeOutcome::waiting(Wait::Until(deadline))
    }

    fn type_next(&mut self, state: &mut StreamState, now: Instant) -> WakeOutcome {
        let Some(ch) = state.take_next() else {
            self.pacing.deadline = None;
            self.pacing.delay = None;
            if state.is_complete() {
                return self.finish(state, String::new());
            }
            return WakeOutcome::waiting(Wait::Indefinite);
        };

        state.set_phase(TypingPhase::Typing);
        self.pacing.last_reveal_at = Some(now);
        let remaining = state.pending_len();

        if remaining == 0 {
            self.pacing.deadline = None;
            self.pacing.delay = None;
            if state.is_complete() {
                return self.finish(state, ch.to_string());
            }
            tracing::trace!("Ran out of text, waiting for the next fragment");
            return WakeOutcome {
                reveal: Some(Reveal {
                    text: ch.to_string(),
                    is_terminal: false,
                }),
                failure: None,
                wait: Wait::Indefinite,
            };
        }

        let delay = match (state.is_complete(), self.pacing.delay) {
            (true, Some(previous)) => previous.mul_f64(self.config.damping),
            (false, Some(previous)) => self
                .backlog_delay(remaining)
                .max(previous.mul_f64(self.config.damping)),
            (_, None) => self.backlog_delay(remaining),
        };
        let deadline = now + delay;
        self.pacing.delay = Some(delay);
        self.pacing.deadline = Some(deadline);

        WakeOutcome {
            reveal: Some(Reveal {
                text: ch.to_string(),
                is_terminal: false,
            }),
            failure: None,
            wait: Wait::Until(deadline),
        }
    }

    /// Terminal reveal: hand back `text`, reset the stream and go idle.
    fn finish(&mut self, state: &mut StreamState, text: String) -> WakeOutcome {
        let failure = state.take_failure();
        tracing::debug!(
            revealed = state.received_len(),
            failed = failure.is_some(),
            "Generation drained"
        );
        state.reset();
        self.pacing = PacingState::default();
        WakeOutcome {
            reveal: Some(Reveal {
                text,
                is_terminal: true,
            }),
            failure,
            wait: Wait::Indefinite,
        }
    }

    fn backlog_delay(&self, remaining: usize) -> Duration {
        let remaining = u32::try_from(remaining).unwrap_or(u32::MAX).max(1);
        self.config.base_time / remaining
    }
}

//! Shared stream state and the token buffer handle.
//!
//! [`StreamState`] is the single record both roles touch: the producer appends
//! fragments and raises flags, the scheduler consumes characters. Every field
//! lives behind one `parking_lot::Mutex`; the paired `Condvar` is how the
//! producer wakes the scheduler.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Scheduler phase, as last set by the typing machine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TypingPhase {
    /// No generation active
    #[default]
    Idle,
    /// Revealing characters on a timer (or waiting for the next fragment)
    Typing,
    /// Abort requested; everything is revealed as soon as it arrives
    Flushing,
}

/// Text received but not yet revealed, plus the stream flags
///
/// Invariant: `cursor + pending.len() == received`. `received` only grows
/// until [`StreamState::reset`].
#[derive(Debug, Default)]
pub struct StreamState {
    pending: VecDeque<char>,
    cursor: usize,
    received: usize,
    is_complete: bool,
    is_aborting: bool,
    active: bool,
    phase: TypingPhase,
    failure: Option<String>,
    signaled: bool,
    appends: u64,
    shutdown: bool,
}

impl StreamState {
    /// Characters waiting to be revealed
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Characters already revealed in this generation
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Characters received in this generation
    #[must_use]
    pub fn received_len(&self) -> usize {
        self.received
    }

    /// Whether the producer has sent its final fragment
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    /// Whether an abort request is waiting to be handled
    #[must_use]
    pub fn is_aborting(&self) -> bool {
        self.is_aborting
    }

    /// Whether a generation is in flight
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current scheduler phase
    #[must_use]
    pub fn phase(&self) -> TypingPhase {
        self.phase
    }

    pub(crate) fn begin(&mut self) {
        self.reset();
        self.active = true;
        self.phase = TypingPhase::Typing;
    }

    pub(crate) fn push_fragment(&mut self, fragment: &str, is_final: bool) {
        let before = self.pending.len();
        self.pending.extend(fragment.chars());
        self.received += self.pending.len() - before;
        if is_final {
            self.is_complete = true;
        }
        self.appends = self.appends.wrapping_add(1);
    }

    pub(crate) fn take_next(&mut self) -> Option<char> {
        let ch = self.pending.pop_front()?;
        self.cursor += 1;
        Some(ch)
    }

    pub(crate) fn drain_pending(&mut self) -> String {
        self.cursor += self.pending.len();
        self.pending.drain(..).collect()
    }

    pub(crate) fn mark_aborting(&mut self) {
        self.is_aborting = true;
    }

    pub(crate) fn clear_abort(&mut self) {
        self.is_aborting = false;
    }

    pub(crate) fn set_phase(&mut self, phase: TypingPhase) {
        self.phase = phase;
    }

    pub(crate) fn take_failure(&mut self) -> Option<String> {
        self.failure.take()
    }

    pub(crate) fn fail(&mut self, reason: String) {
        self.failure.get_or_insert(reason);
        self.is_complete = true;
    }

    pub(crate) fn take_signal(&mut self) -> bool {
        std::mem::take(&mut self.signaled)
    }

    pub(crate) fn is_signaled(&self) -> bool {
        self.signaled
    }

    pub(crate) fn appends(&self) -> u64 {
        self.appends
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Waiting on the producer with nothing left to type
    pub(crate) fn is_starved(&self) -> bool {
        self.active && !self.is_complete && self.pending.is_empty()
    }

    /// Clear everything belonging to the current generation.
    ///
    /// The append counter and the shutdown flag outlive generations.
    pub(crate) fn reset(&mut self) {
        self.pending.clear();
        self.cursor = 0;
        self.received = 0;
        self.is_complete = false;
        self.is_aborting = false;
        self.active = false;
        self.phase = TypingPhase::Idle;
        self.failure = None;
    }
}

/// Point-in-time copy of the stream state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSnapshot {
    /// Characters revealed so far
    pub cursor: usize,
    /// Characters waiting to be revealed
    pub pending: usize,
    /// Characters received so far
    pub received: usize,
    /// Final fragment seen
    pub is_complete: bool,
    /// Abort request not yet handled
    pub is_aborting: bool,
    /// Generation in flight
    pub active: bool,
    /// Scheduler phase
    pub phase: TypingPhase,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<StreamState>,
    pub(crate) wake: Condvar,
}

/// Cloneable handle to the shared stream state
///
/// The producer side (`append`, `finish_with_error`) and the UI side
/// (`request_abort`) hold clones; the [`TypingScheduler`](super::TypingScheduler)
/// holds another and is the only consumer.
#[derive(Clone)]
pub struct TokenBuffer {
    shared: Arc<Shared>,
}

impl Default for TokenBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBuffer")
            .field("state", &self.snapshot())
            .finish()
    }
}

impl TokenBuffer {
    /// Create an idle buffer
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StreamState::default()),
                wake: Condvar::new(),
            }),
        }
    }

    /// Reset the stream and mark a new generation active
    ///
    /// Only one generation may run at a time; callers serialize sends.
    pub fn begin(&self) {
        let mut state = self.shared.state.lock();
        if state.active {
            tracing::warn!(
                pending = state.pending_len(),
                "Starting a generation while another is still active"
            );
        }
        state.begin();
        tracing::debug!("Generation started");
    }

    /// Append a fragment from the producer and wake the scheduler
    ///
    /// An append on an idle buffer begins a generation. Fragments after the
    /// final marker are dropped.
    pub fn append(&self, fragment: &str, is_final: bool) {
        let mut state = self.shared.state.lock();
        if !state.active {
            state.begin();
        } else if state.is_complete {
            tracing::warn!(
                len = fragment.len(),
                "Dropping fragment received after the final marker"
            );
            return;
        }
        state.push_fragment(fragment, is_final);
        tracing::trace!(
            len = fragment.len(),
            is_final,
            pending = state.pending_len(),
            "Fragment appended"
        );
        self.signal(state);
    }

    /// Ask the scheduler to flush everything and stop pacing
    ///
    /// Returns `false` (and does nothing) when no generation is active.
    pub fn request_abort(&self) -> bool {
        let mut state = self.shared.state.lock();
        if !state.active {
            tracing::debug!("Abort ignored, no active generation");
            return false;
        }
        state.mark_aborting();
        tracing::debug!(pending = state.pending_len(), "Abort requested");
        self.signal(state);
        true
    }

    /// End the stream with an error
    ///
    /// Whatever is buffered still gets revealed; the sink is told about the
    /// failure after the terminal reveal.
    pub fn finish_with_error(&self, reason: impl Into<String>) {
        let mut state = self.shared.state.lock();
        if !state.active {
            return;
        }
        let reason = reason.into();
        tracing::warn!(reason = %reason, "Generation finished with an error");
        state.fail(reason);
        self.signal(state);
    }

    /// Whether a generation is in flight
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().active
    }

    /// Current scheduler phase
    #[must_use]
    pub fn phase(&self) -> TypingPhase {
        self.shared.state.lock().phase
    }

    /// Copy of the current state
    #[must_use]
    pub fn snapshot(&self) -> StreamSnapshot {
        let state = self.shared.state.lock();
        StreamSnapshot {
            cursor: state.cursor,
            pending: state.pending.len(),
            received: state.received,
            is_complete: state.is_complete,
            is_aborting: state.is_aborting,
            active: state.active,
            phase: state.phase,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.signal(state);
    }

    fn signal(&self, mut state: MutexGuard<'_, StreamState>) {
        state.signaled = true;
        drop(state);
        self.shared.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_counts_characters_not_bytes() {
        let buffer = TokenBuffer::new();
        buffer.append("héllo", false);

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.pending, 5);
        assert_eq!(snapshot.received, 5);
        assert_eq!(snapshot.cursor, 0);
        assert!(snapshot.active);
        assert!(!snapshot.is_complete);
    }

    #[test]
    fn test_append_on_idle_buffer_begins_generation() {
        let buffer = TokenBuffer::new();
        assert!(!buffer.is_active());
        assert_eq!(buffer.phase(), TypingPhase::Idle);

        buffer.append("a", false);
        assert!(buffer.is_active());
        assert_eq!(buffer.phase(), TypingPhase::Typing);
    }

    #[test]
    fn test_final_marker_completes_stream() {
        let buffer = TokenBuffer::new();
        buffer.append("Hello", false);
        buffer.append(" world", true);

        let snapshot = buffer.snapshot();
        assert!(snapshot.is_complete);
        assert_eq!(snapshot.received, 11);
    }

    #[test]
    fn test_fragments_after_final_are_dropped() {
        let buffer = TokenBuffer::new();
        buffer.append("done", true);
        buffer.append("late", false);

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.received, 4);
        assert!(snapshot.is_complete);
    }

    #[test]
    fn test_abort_without_generation_is_noop() {
        let buffer = TokenBuffer::new();
        assert!(!buffer.request_abort());
        assert!(!buffer.snapshot().is_aborting);
    }

    #[test]
    fn test_abort_during_generation_sets_flag() {
        let buffer = TokenBuffer::new();
        buffer.begin();
        assert!(buffer.request_abort());
        assert!(buffer.snapshot().is_aborting);
    }

    #[test]
    fn test_begin_resets_previous_generation() {
        let buffer = TokenBuffer::new();
        buffer.append("left over", false);
        buffer.begin();

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.received, 0);
        assert!(snapshot.active);
        assert!(!snapshot.is_complete);
    }

    #[test]
    fn test_finish_with_error_marks_complete() {
        let buffer = TokenBuffer::new();
        buffer.append("partial", false);
        buffer.finish_with_error("connection reset");

        let mut state = buffer.shared().state.lock();
        assert!(state.is_complete());
        assert_eq!(state.take_failure().as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_state_cursor_invariant() {
        let mut state = StreamState::default();
        state.begin();
        state.push_fragment("abc", false);
        assert_eq!(state.take_next(), Some('a'));
        assert_eq!(state.cursor() + state.pending_len(), state.received_len());

        assert_eq!(state.drain_pending(), "bc");
        assert_eq!(state.cursor(), 3);
        assert_eq!(state.pending_len(), 0);
        assert_eq!(state.cursor() + state.pending_len(), state.received_len());
    }

    #[test]
    fn test_append_signals_scheduler() {
        let buffer = TokenBuffer::new();
        buffer.append("x", false);
        let mut state = buffer.shared().state.lock();
        assert!(state.take_signal());
        assert!(!state.take_signal());
    }
}

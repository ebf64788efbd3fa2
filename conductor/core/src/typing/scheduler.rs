//! The typing scheduler thread.
//!
//! One OS thread per [`TokenBuffer`]. It blocks on the buffer's condvar until
//! the producer signals or the current deadline passes, runs one
//! [`TypingMachine::on_wake`] under the lock, then hands the reveal to the
//! [`DisplaySink`] with the lock released.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;

use super::clock::{Clock, SystemClock};
use super::pacing::{Reveal, TypingConfig, TypingMachine, Wait};
use super::sink::{DisplaySink, SinkError};
use super::state::{Shared, TokenBuffer};

const THREAD_NAME: &str = "storyloom-typing";

/// Errors from the scheduler thread
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The sink rejected a reveal; the thread stopped
    #[error("display sink failed: {0}")]
    Sink(#[from] SinkError),

    /// The thread panicked (usually inside the sink)
    #[error("typing thread panicked")]
    Panicked,

    /// The OS refused to start the thread
    #[error("failed to spawn typing thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Handle to a running typing thread
///
/// Dropping the handle stops the thread and waits for it.
pub struct TypingScheduler {
    buffer: TokenBuffer,
    handle: Option<JoinHandle<Result<(), SchedulerError>>>,
}

impl std::fmt::Debug for TypingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypingScheduler")
            .field("running", &self.is_running())
            .finish()
    }
}

impl TypingScheduler {
    /// Start typing from `buffer` into `sink` on the system clock
    pub fn spawn<S: DisplaySink>(
        buffer: TokenBuffer,
        sink: S,
        config: TypingConfig,
    ) -> Result<Self, SchedulerError> {
        Self::spawn_with_clock(buffer, sink, config, SystemClock)
    }

    /// Start typing with an explicit time source
    pub fn spawn_with_clock<S: DisplaySink, C: Clock>(
        buffer: TokenBuffer,
        sink: S,
        config: TypingConfig,
        clock: C,
    ) -> Result<Self, SchedulerError> {
        let shared = Arc::clone(buffer.shared());
        let machine = TypingMachine::new(config);

        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(&shared, sink, machine, &clock))
            .map_err(SchedulerError::Spawn)?;

        tracing::debug!(
            base_time_ms = config.base_time.as_millis() as u64,
            damping = config.damping,
            "Typing scheduler started"
        );

        Ok(Self {
            buffer,
            handle: Some(handle),
        })
    }

    /// The buffer this scheduler consumes
    #[must_use]
    pub fn buffer(&self) -> &TokenBuffer {
        &self.buffer
    }

    /// Whether the thread is still alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it
    ///
    /// Text still pending is not revealed. Returns the error that stopped the
    /// thread early, if any.
    pub fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<(), SchedulerError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.buffer.shutdown();
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Panicked),
        }
    }
}

impl Drop for TypingScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.stop_and_join() {
            tracing::warn!(error = %e, "Typing scheduler ended with an error");
        }
    }
}

/// Resets the stream if delivery fails or unwinds
struct ResetOnFailure<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for ResetOnFailure<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.state.lock().reset();
        }
    }
}

fn run<S: DisplaySink, C: Clock>(
    shared: &Shared,
    mut sink: S,
    mut machine: TypingMachine,
    clock: &C,
) -> Result<(), SchedulerError> {
    let stall_timeout = machine.config().stall_timeout;
    let mut wait = Wait::Indefinite;

    loop {
        let mut state = shared.state.lock();

        match wait {
            Wait::Indefinite => {
                while !state.is_signaled() && !state.is_shutdown() {
                    match stall_timeout {
                        Some(limit) if state.is_starved() => {
                            let seen = state.appends();
                            let timed_out = shared.wake.wait_for(&mut state, limit).timed_out();
                            if timed_out
                                && !state.is_signaled()
                                && state.appends() == seen
                                && state.is_starved()
                            {
                                tracing::warn!(
                                    stall_secs = limit.as_secs_f64(),
                                    revealed = state.cursor(),
                                    "No text from the backend, ending generation"
                                );
                                state.fail(format!(
                                    "no text received for {:.1}s",
                                    limit.as_secs_f64()
                                ));
                                break;
                            }
                        }
                        _ => shared.wake.wait(&mut state),
                    }
                }
            }
            Wait::Until(deadline) => {
                while !state.is_signaled() && !state.is_shutdown() {
                    let now = clock.now();
                    if now >= deadline {
                        break;
                    }
                    shared.wake.wait_for(&mut state, deadline - now);
                }
            }
        }

        if state.is_shutdown() {
            tracing::debug!(pending = state.pending_len(), "Typing scheduler stopping");
            return Ok(());
        }

        let signaled = state.take_signal();
        let outcome = machine.on_wake(&mut state, signaled, clock.now());
        drop(state);

        wait = outcome.wait;
        if outcome.reveal.is_none() && outcome.failure.is_none() {
            continue;
        }

        let mut guard = ResetOnFailure {
            shared,
            armed: true,
        };
        if let Err(e) = deliver(&mut sink, outcome.reveal, outcome.failure.as_deref()) {
            tracing::error!(error = %e, "Display sink failed, typing stopped");
            return Err(e.into());
        }
        guard.armed = false;
    }
}

fn deliver<S: DisplaySink>(
    sink: &mut S,
    reveal: Option<Reveal>,
    failure: Option<&str>,
) -> Result<(), SinkError> {
    if let Some(reveal) = reveal {
        sink.reveal(&reveal.text, reveal.is_terminal)?;
    }
    if let Some(reason) = failure {
        sink.generation_failed(reason)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typing::sink::{ChannelSink, SinkEvent};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> SinkEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for the scheduler")
            .expect("sink channel closed")
    }

    async fn until_terminal(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> Vec<SinkEvent> {
        let mut events = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = matches!(event, SinkEvent::Reveal { is_terminal: true, .. });
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn joined(events: &[SinkEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Reveal { text, .. } => Some(text.as_str()),
                SinkEvent::Failed(_) => None,
            })
            .collect()
    }

    fn fast() -> TypingConfig {
        TypingConfig::default().with_base_time(Duration::from_millis(20))
    }

    struct FailingSink;

    impl DisplaySink for FailingSink {
        fn reveal(&mut self, _text: &str, _is_terminal: bool) -> Result<(), SinkError> {
            Err(SinkError::Other("display gone".to_string()))
        }
    }

    struct PanickingSink;

    impl DisplaySink for PanickingSink {
        fn reveal(&mut self, _text: &str, _is_terminal: bool) -> Result<(), SinkError> {
            panic!("sink blew up");
        }
    }

    #[tokio::test]
    async fn test_scheduler_types_fragments_in_order() {
        let buffer = TokenBuffer::new();
        let (sink, mut rx) = ChannelSink::new();
        let scheduler = TypingScheduler::spawn(buffer.clone(), sink, fast()).unwrap();

        buffer.append("Hello", false);
        buffer.append(" world", true);

        let events = until_terminal(&mut rx).await;
        assert_eq!(joined(&events), "Hello world");
        assert_eq!(events.len(), 11);
        assert!(!buffer.is_active());

        scheduler.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_abort_flushes_remaining_text() {
        let buffer = TokenBuffer::new();
        let (sink, mut rx) = ChannelSink::new();
        let config = TypingConfig::default().with_base_time(Duration::from_secs(10));
        let scheduler = TypingScheduler::spawn(buffer.clone(), sink, config).unwrap();

        buffer.append("abcdef", true);
        assert_eq!(
            next_event(&mut rx).await,
            SinkEvent::Reveal {
                text: "a".to_string(),
                is_terminal: false
            }
        );

        assert!(buffer.request_abort());
        assert_eq!(
            next_event(&mut rx).await,
            SinkEvent::Reveal {
                text: "bcdef".to_string(),
                is_terminal: true
            }
        );
        assert!(!buffer.is_active());

        scheduler.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_reports_backend_failure_after_terminal_reveal() {
        let buffer = TokenBuffer::new();
        let (sink, mut rx) = ChannelSink::new();
        let scheduler = TypingScheduler::spawn(buffer.clone(), sink, fast()).unwrap();

        buffer.append("ok", false);
        buffer.finish_with_error("connection reset");

        let events = until_terminal(&mut rx).await;
        assert_eq!(joined(&events), "ok");
        assert_eq!(
            next_event(&mut rx).await,
            SinkEvent::Failed("connection reset".to_string())
        );

        scheduler.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_stalled_producer_ends_generation() {
        let buffer = TokenBuffer::new();
        let (sink, mut rx) = ChannelSink::new();
        let config = fast().with_stall_timeout(Some(Duration::from_millis(50)));
        let scheduler = TypingScheduler::spawn(buffer.clone(), sink, config).unwrap();

        buffer.append("hi", false);

        let events = until_terminal(&mut rx).await;
        assert_eq!(joined(&events), "hi");
        assert!(matches!(next_event(&mut rx).await, SinkEvent::Failed(_)));
        assert!(!buffer.is_active());

        scheduler.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_second_generation_after_first_completes() {
        let buffer = TokenBuffer::new();
        let (sink, mut rx) = ChannelSink::new();
        let scheduler = TypingScheduler::spawn(buffer.clone(), sink, fast()).unwrap();

        buffer.append("one", true);
        assert_eq!(joined(&until_terminal(&mut rx).await), "one");

        buffer.begin();
        buffer.append("two", true);
        assert_eq!(joined(&until_terminal(&mut rx).await), "two");

        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_sink_error_stops_thread_and_resets_state() {
        let buffer = TokenBuffer::new();
        let scheduler = TypingScheduler::spawn(buffer.clone(), FailingSink, fast()).unwrap();

        buffer.append("xyz", true);

        let result = scheduler.shutdown();
        // Shutdown can win the race against the first wake
        if let Err(e) = result {
            assert!(matches!(e, SchedulerError::Sink(SinkError::Other(_))));
            assert!(!buffer.is_active());
            assert_eq!(buffer.snapshot().pending, 0);
        }
    }

    #[tokio::test]
    async fn test_panicking_sink_resets_state() {
        let buffer = TokenBuffer::new();
        let scheduler = TypingScheduler::spawn(buffer.clone(), PanickingSink, fast()).unwrap();

        buffer.append("x", true);
        tokio::time::timeout(WAIT, async {
            while scheduler.is_running() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(scheduler.shutdown(), Err(SchedulerError::Panicked)));
        assert!(!buffer.is_active());
    }

    #[test]
    fn test_idle_scheduler_shuts_down_cleanly() {
        let scheduler =
            TypingScheduler::spawn(TokenBuffer::new(), ChannelSink::new().0, fast()).unwrap();
        assert!(scheduler.is_running());
        scheduler.shutdown().unwrap();
    }
}

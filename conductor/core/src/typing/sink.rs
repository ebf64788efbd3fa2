//! Where revealed text goes.

use thiserror::Error;
use tokio::sync::mpsc;

/// Errors a display sink can report
///
/// Any error stops the scheduler; the stream state is reset first so the
/// next generation starts clean.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The receiving side has gone away
    #[error("display sink closed")]
    Closed,

    /// Writing to the display failed
    #[error("display write failed: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

/// Receives revealed text from the typing scheduler
///
/// Called on the scheduler thread, never while the stream lock is held, in
/// reveal order. `reveal` is called exactly once per generation with
/// `is_terminal = true`.
pub trait DisplaySink: Send + 'static {
    /// Append `text` to the display
    fn reveal(&mut self, text: &str, is_terminal: bool) -> Result<(), SinkError>;

    /// The generation ended with an error (called after the terminal reveal)
    fn generation_failed(&mut self, reason: &str) -> Result<(), SinkError> {
        let _ = reason;
        Ok(())
    }
}

/// Event emitted by [`ChannelSink`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    /// Text revealed
    Reveal {
        /// Revealed text
        text: String,
        /// Last reveal of the generation
        is_terminal: bool,
    },
    /// The generation ended with an error
    Failed(String),
}

/// A sink that forwards reveals over a tokio channel
///
/// Lets async code consume typed text without touching the scheduler thread.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver for its events
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DisplaySink for ChannelSink {
    fn reveal(&mut self, text: &str, is_terminal: bool) -> Result<(), SinkError> {
        self.tx
            .send(SinkEvent::Reveal {
                text: text.to_string(),
                is_terminal,
            })
            .map_err(|_| SinkError::Closed)
    }

    fn generation_failed(&mut self, reason: &str) -> Result<(), SinkError> {
        self.tx
            .send(SinkEvent::Failed(reason.to_string()))
            .map_err(|_| SinkError::Closed)
    }
}

//! Typewriter engine
//!
//! Generated text arrives in bursts; this module reveals it one character at a
//! time at a rate that adapts to how much is waiting.
//!
//! # Architecture
//!
//! ```text
//! backend task ──append()──► TokenBuffer ──condvar──► TypingScheduler ──reveal()──► DisplaySink
//!        UI ──request_abort()──┘                      (storyloom-typing thread)
//! ```
//!
//! - [`TokenBuffer`]: shared state behind one mutex. Producers and the abort
//!   handler only mutate it and signal.
//! - [`TypingMachine`]: the per-wake decision (reveal, flush, retarget, wait).
//! - [`TypingScheduler`]: the thread that blocks on the condvar and drives the
//!   machine.
//! - [`DisplaySink`]: where revealed text goes.

mod clock;
mod pacing;
mod producer;
mod scheduler;
mod sink;
mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use pacing::{PacingState, Reveal, TypingConfig, TypingMachine, Wait, WakeOutcome};
pub use producer::forward_stream;
pub use scheduler::{SchedulerError, TypingScheduler};
pub use sink::{ChannelSink, DisplaySink, SinkError, SinkEvent};
pub use state::{StreamSnapshot, StreamState, TokenBuffer, TypingPhase};

//! Conductor Messages
//!
//! Messages sent from the Conductor to UI surfaces. A surface renders what it
//! is told: the story area, the lock on it, the generating indicator and the
//! tab bar all follow these messages.

use serde::{Deserialize, Serialize};

use crate::narrative::ProjectId;

/// Messages from Conductor to UI Surface
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConductorMessage {
    // ============================================
    // Story Messages
    // ============================================
    /// The whole story text of a project was replaced (prompt assembly)
    StoryReplaced {
        /// Project whose story changed
        project: ProjectId,
        /// New story text
        story: String,
    },

    /// Generated text revealed by the typing engine
    ///
    /// Only sent while the generating project is the current tab.
    StoryText {
        /// Project receiving the text
        project: ProjectId,
        /// Revealed text (one character, or a flush after abort)
        text: String,
    },

    /// Lock or unlock the story area for editing
    StoryLocked {
        /// Whether editing is blocked
        locked: bool,
    },

    /// Generation indicator on or off
    Generating {
        /// Whether a generation is running
        active: bool,
    },

    /// The generation ended with an error (after its text was revealed)
    GenerationFailed {
        /// Project that was generating
        project: ProjectId,
        /// Error description
        error: String,
    },

    // ============================================
    // Tab Messages
    // ============================================
    /// A tab became current
    TabSelected {
        /// Tab index
        index: usize,
        /// Project in the tab
        project: ProjectId,
    },

    // ============================================
    // System Messages
    // ============================================
    /// System notification
    Notify {
        /// Notification level
        level: NotifyLevel,
        /// Message content
        message: String,
    },

    /// Conductor state change
    State {
        /// The new state
        state: ConductorState,
    },
}

/// Notification levels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyLevel {
    /// Informational
    Info,
    /// Warning
    Warning,
    /// Error
    Error,
}

/// Conductor operational states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConductorState {
    /// Ready for input
    Ready,
    /// Streaming and typing a generation
    Generating,
    /// Abort requested, flushing what is left
    Aborting,
    /// Shutting down
    ShuttingDown,
}

impl ConductorState {
    /// Human-readable description
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::Generating => "Writing...",
            Self::Aborting => "Stopping...",
            Self::ShuttingDown => "Shutting down...",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conductor_state_description() {
        assert_eq!(ConductorState::Ready.description(), "Ready");
        assert_eq!(ConductorState::Generating.description(), "Writing...");
    }

    #[test]
    fn test_messages_serialize() {
        let message = ConductorMessage::StoryLocked { locked: true };
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(json, r#"{"StoryLocked":{"locked":true}}"#);
    }
}

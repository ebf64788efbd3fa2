//! Prompt assembly
//!
//! Turns a project plus the writer's entry into a [`GenerationRequest`]:
//!
//! ```text
//! memory  = memory.trim() + "\n\n" + description ... + "\n\n"
//! story   = story.trim() + "\n\n" + "{command} {entry}\n\n"
//! stop    = [command]
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::GenerationRequest;
use crate::narrative::{Project, ProjectRegistry};

/// How the writer's entry is framed in the story
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    /// Dialogue: `You: ...`
    #[default]
    You,
    /// Action: `> ...`
    Action,
}

impl CommandType {
    /// Prefix written before the entry, also used as the stop sequence
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::You => "You:",
            Self::Action => ">",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::You => write!(f, "you"),
            Self::Action => write!(f, "action"),
        }
    }
}

/// Unrecognized command type name
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown command type {0:?} (expected \"you\" or \"action\")")]
pub struct ParseCommandTypeError(String);

impl FromStr for CommandType {
    type Err = ParseCommandTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "you" | "you:" | "say" => Ok(Self::You),
            "action" | ">" | "do" => Ok(Self::Action),
            other => Err(ParseCommandTypeError(other.to_string())),
        }
    }
}

/// Memory text: the project's memory followed by every description in the
/// scene
#[must_use]
pub fn build_memory(registry: &ProjectRegistry, project: &Project) -> String {
    let mut memory = project.memory.trim().to_string();
    for character in registry.active_cast(project) {
        if !character.description.is_empty() {
            memory.push_str("\n\n");
            memory.push_str(&character.description);
        }
    }
    memory.push_str("\n\n");
    memory
}

/// Story text with the entry appended in the given framing
///
/// An empty entry leaves the (trimmed) story as it is.
#[must_use]
pub fn build_story(story: &str, entry: &str, command: CommandType) -> String {
    let mut story = story.trim().to_string();
    let entry = entry.trim();
    if !entry.is_empty() {
        if !story.is_empty() {
            story.push_str("\n\n");
        }
        story.push_str(&format!("{} {entry}\n\n", command.prefix()));
    }
    story
}

/// Full request for the next generation
#[must_use]
pub fn build_request(
    registry: &ProjectRegistry,
    project: &Project,
    entry: &str,
    command: CommandType,
) -> GenerationRequest {
    GenerationRequest::new(build_story(&project.story, entry, command))
        .with_memory(build_memory(registry, project))
        .with_max_length(registry.max_tokens())
        .with_temperature(registry.temperature())
        .with_stop_sequence(vec![command.prefix().to_string()])
}

//! Characters

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a character
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacterId(pub Uuid);

impl CharacterId {
    /// Create a new unique character ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CharacterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CharacterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A reusable character
///
/// Characters are shared across projects. A project lists which characters
/// belong to it and which of those are in the current scene; only the scene's
/// descriptions reach the prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Character {
    /// Identity, stable across renames
    pub id: CharacterId,
    /// Display name
    pub name: String,
    /// Text added to the prompt memory while the character is in the scene
    pub description: String,
}

impl Character {
    /// Create a character with an empty description
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: CharacterId::new(),
            name: name.into(),
            description: String::new(),
        }
    }

    /// Set the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Case-insensitive lookup key
    #[must_use]
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }
}

//! Projects

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::character::CharacterId;

/// Label shown for a project that has no name yet
pub const UNTITLED: &str = "Untitled";

/// Unique identifier for a project
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    /// Create a new unique project ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A story with its memory and cast
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Project {
    /// Identity, stable across renames
    pub id: ProjectId,
    /// Name (empty until the project is named and saved by name)
    pub name: String,
    /// Context placed in front of the story on every generation
    pub memory: String,
    /// The running narrative
    pub story: String,
    /// Characters that belong to this project
    pub project_characters: HashSet<CharacterId>,
    /// Characters in the current scene (a subset of `project_characters`)
    pub active_characters: HashSet<CharacterId>,
    /// Character shown in the detail view
    pub selected_character: Option<CharacterId>,
}

impl Project {
    /// Create an unnamed, empty project
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the project has a name
    #[must_use]
    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }

    /// Name for display, "Untitled" when unnamed
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.is_named() {
            &self.name
        } else {
            UNTITLED
        }
    }

    /// Case-insensitive lookup key
    #[must_use]
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }

    /// Drop a character from the project, the scene and the selection
    pub(crate) fn forget_character(&mut self, id: CharacterId) {
        self.project_characters.remove(&id);
        self.active_characters.remove(&id);
        if self.selected_character == Some(id) {
            self.selected_character = None;
        }
    }
}

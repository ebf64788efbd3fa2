//! The project registry
//!
//! Owns every character and project, the open tabs and the generation
//! settings. One registry per application; the conductor holds it behind a
//! lock and UI surfaces go through the conductor.

use std::collections::HashMap;

use thiserror::Error;

use super::character::{Character, CharacterId};
use super::pattern::{contains_pattern, wildcard_match};
use super::project::{Project, ProjectId};

/// Default token budget per generation
pub const DEFAULT_MAX_TOKENS: u32 = 100;
/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Errors from registry operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NarrativeError {
    /// Rejected project name
    #[error("invalid project name: {0:?}")]
    InvalidProjectName(String),

    /// Rejected character name
    #[error("invalid character name: {0:?}")]
    InvalidCharacterName(String),

    /// Tab index past the end
    #[error("tab {index} out of range ({len} open)")]
    TabOutOfRange {
        /// Requested index
        index: usize,
        /// Number of open tabs
        len: usize,
    },

    /// No tab is open
    #[error("no project is open")]
    NoOpenProject,

    /// No named project with this name
    #[error("no project named {0:?}")]
    UnknownProject(String),

    /// No character with this name or id
    #[error("no character named {0:?}")]
    UnknownCharacter(String),
}

/// One row of a character search
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacterEntry {
    /// Character id
    pub id: CharacterId,
    /// Display name
    pub name: String,
    /// Belongs to the current project
    pub in_project: bool,
    /// In the current scene
    pub active: bool,
}

/// Result of [`ProjectRegistry::search_characters`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CharacterSearch {
    /// False when the query was empty and the project's own cast is listed
    pub searching: bool,
    /// Matching characters, ordered by name
    pub entries: Vec<CharacterEntry>,
    /// Whether the query could be added as a new character
    pub addable: bool,
}

/// All projects, characters and tabs
#[derive(Clone, Debug)]
pub struct ProjectRegistry {
    characters: HashMap<CharacterId, Character>,
    projects: HashMap<ProjectId, Project>,
    open_tabs: Vec<ProjectId>,
    current: usize,
    max_tokens: u32,
    temperature: f64,
}

impl Default for ProjectRegistry {
    fn default() -> Self {
        Self::start_empty()
    }
}

impl ProjectRegistry {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Registry with no projects and no tabs
    #[must_use]
    pub fn new() -> Self {
        Self {
            characters: HashMap::new(),
            projects: HashMap::new(),
            open_tabs: Vec::new(),
            current: 0,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// Registry with one empty, unnamed tab
    #[must_use]
    pub fn start_empty() -> Self {
        let mut registry = Self::new();
        registry.new_tab();
        registry
    }

    pub(crate) fn insert_character(&mut self, character: Character) {
        self.characters.insert(character.id, character);
    }

    pub(crate) fn insert_project(&mut self, project: Project) {
        self.projects.insert(project.id, project);
    }

    pub(crate) fn push_tab(&mut self, id: ProjectId) {
        self.open_tabs.push(id);
    }

    pub(crate) fn set_current_index(&mut self, index: usize) {
        self.current = index.min(self.open_tabs.len().saturating_sub(1));
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Token budget per generation
    #[must_use]
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Set the token budget
    pub fn set_max_tokens(&mut self, max_tokens: u32) {
        self.max_tokens = max_tokens;
    }

    /// Sampling temperature
    #[must_use]
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Set the sampling temperature (negative values are clamped to zero)
    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature.max(0.0);
    }

    // ========================================================================
    // Tabs
    // ========================================================================

    /// Number of open tabs
    #[must_use]
    pub fn tab_count(&self) -> usize {
        self.open_tabs.len()
    }

    /// Index of the current tab
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Open projects in tab order
    pub fn tabs(&self) -> impl Iterator<Item = &Project> + '_ {
        self.open_tabs.iter().filter_map(|id| self.projects.get(id))
    }

    /// Project shown in the current tab
    #[must_use]
    pub fn current_project(&self) -> Option<&Project> {
        let id = self.open_tabs.get(self.current)?;
        self.projects.get(id)
    }

    /// Mutable access to the current project
    pub fn current_project_mut(&mut self) -> Option<&mut Project> {
        let id = self.open_tabs.get(self.current)?;
        self.projects.get_mut(id)
    }

    /// Id of the current project
    #[must_use]
    pub fn current_project_id(&self) -> Option<ProjectId> {
        self.open_tabs.get(self.current).copied()
    }

    /// Look up a project by id
    #[must_use]
    pub fn project(&self, id: ProjectId) -> Option<&Project> {
        self.projects.get(&id)
    }

    /// Mutable lookup by id
    pub fn project_mut(&mut self, id: ProjectId) -> Option<&mut Project> {
        self.projects.get_mut(&id)
    }

    /// Open a new unnamed project in a new tab; returns the tab index
    ///
    /// The current tab does not change.
    pub fn new_tab(&mut self) -> usize {
        let project = Project::new();
        let id = project.id;
        self.projects.insert(id, project);
        self.open_tabs.push(id);
        tracing::debug!(project = %id, tabs = self.open_tabs.len(), "Opened new tab");
        self.open_tabs.len() - 1
    }

    /// Make `index` the current tab
    pub fn select_tab(&mut self, index: usize) -> Result<&Project, NarrativeError> {
        let id = *self.open_tabs.get(index).ok_or(NarrativeError::TabOutOfRange {
            index,
            len: self.open_tabs.len(),
        })?;
        self.current = index;
        self.projects.get(&id).ok_or(NarrativeError::NoOpenProject)
    }

    /// Close a tab
    ///
    /// Closing an unnamed project discards it; named projects stay available
    /// through [`open_project_by_name`](Self::open_project_by_name). Closing
    /// the last tab opens a fresh empty one.
    pub fn close_tab(&mut self, index: usize) -> Result<ProjectId, NarrativeError> {
        if index >= self.open_tabs.len() {
            return Err(NarrativeError::TabOutOfRange {
                index,
                len: self.open_tabs.len(),
            });
        }

        let id = self.open_tabs.remove(index);
        let unnamed = self.projects.get(&id).is_some_and(|p| !p.is_named());
        if unnamed && !self.open_tabs.contains(&id) {
            self.projects.remove(&id);
        }

        if index < self.current {
            self.current -= 1;
        }
        if self.open_tabs.is_empty() {
            self.new_tab();
        }
        self.current = self.current.min(self.open_tabs.len() - 1);

        tracing::debug!(project = %id, discarded = unnamed, "Closed tab");
        Ok(id)
    }

    /// Open a named project, or switch to its tab if it is already open
    ///
    /// Returns the tab index, which becomes current.
    pub fn open_project_by_name(&mut self, name: &str) -> Result<usize, NarrativeError> {
        let id = self
            .find_project(name)
            .map(|p| p.id)
            .ok_or_else(|| NarrativeError::UnknownProject(name.to_string()))?;

        let index = match self.open_tabs.iter().position(|open| *open == id) {
            Some(index) => index,
            None => {
                self.open_tabs.push(id);
                self.open_tabs.len() - 1
            }
        };
        self.current = index;
        Ok(index)
    }

    // ========================================================================
    // Projects
    // ========================================================================

    /// Named projects, ordered by name
    #[must_use]
    pub fn named_projects(&self) -> Vec<&Project> {
        let mut projects: Vec<&Project> =
            self.projects.values().filter(|p| p.is_named()).collect();
        projects.sort_by_key(|p| p.key());
        projects
    }

    /// Find a named project, ignoring case
    #[must_use]
    pub fn find_project(&self, name: &str) -> Option<&Project> {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return None;
        }
        self.projects.values().find(|p| p.key() == key)
    }

    /// Whether `name` could be given to project `renaming`
    ///
    /// Names are trimmed, must not be empty, `+` or `untitled`, and must not
    /// clash (ignoring case) with another named project.
    #[must_use]
    pub fn is_project_name_valid(&self, name: &str, renaming: Option<ProjectId>) -> bool {
        let key = name.trim().to_lowercase();
        if key.is_empty() || key == "+" || key == "untitled" {
            return false;
        }
        !self
            .projects
            .values()
            .any(|p| p.key() == key && Some(p.id) != renaming)
    }

    /// Rename the project in tab `index`
    pub fn rename_project(&mut self, index: usize, name: &str) -> Result<(), NarrativeError> {
        let id = *self.open_tabs.get(index).ok_or(NarrativeError::TabOutOfRange {
            index,
            len: self.open_tabs.len(),
        })?;
        if !self.is_project_name_valid(name, Some(id)) {
            return Err(NarrativeError::InvalidProjectName(name.to_string()));
        }
        let project = self
            .projects
            .get_mut(&id)
            .ok_or(NarrativeError::NoOpenProject)?;
        tracing::debug!(from = %project.name, to = %name.trim(), "Renamed project");
        project.name = name.trim().to_string();
        Ok(())
    }

    /// Named projects whose lower-cased name contains `query`
    #[must_use]
    pub fn search_projects(&self, query: &str) -> Vec<&Project> {
        let pattern = contains_pattern(query);
        self.named_projects()
            .into_iter()
            .filter(|p| wildcard_match(&pattern, &p.key()))
            .collect()
    }

    // ========================================================================
    // Characters
    // ========================================================================

    /// Look up a character by id
    #[must_use]
    pub fn character(&self, id: CharacterId) -> Option<&Character> {
        self.characters.get(&id)
    }

    /// Find a character by name, ignoring case
    #[must_use]
    pub fn find_character(&self, name: &str) -> Option<&Character> {
        let key = name.trim().to_lowercase();
        self.characters.values().find(|c| c.key() == key)
    }

    /// Every character, ordered by name
    #[must_use]
    pub fn characters(&self) -> Vec<&Character> {
        let mut characters: Vec<&Character> = self.characters.values().collect();
        characters.sort_by_key(|c| c.key());
        characters
    }

    /// Characters of a project, ordered by name
    #[must_use]
    pub fn project_cast(&self, project: &Project) -> Vec<&Character> {
        self.sorted(project.project_characters.iter().copied())
    }

    /// Characters in a project's scene, ordered by name
    #[must_use]
    pub fn active_cast(&self, project: &Project) -> Vec<&Character> {
        self.sorted(project.active_characters.iter().copied())
    }

    fn sorted(&self, ids: impl Iterator<Item = CharacterId>) -> Vec<&Character> {
        let mut characters: Vec<&Character> =
            ids.filter_map(|id| self.characters.get(&id)).collect();
        characters.sort_by_key(|c| c.key());
        characters
    }

    /// Whether `name` could be given to character `renaming`
    #[must_use]
    pub fn is_character_name_valid(&self, name: &str, renaming: Option<CharacterId>) -> bool {
        let key = name.trim().to_lowercase();
        if key.is_empty() || key == "+" {
            return false;
        }
        !self
            .characters
            .values()
            .any(|c| c.key() == key && Some(c.id) != renaming)
    }

    /// Create a character in the current project's scene and select it
    pub fn add_character(&mut self, name: &str) -> Result<CharacterId, NarrativeError> {
        let name = name.trim();
        if !self.is_character_name_valid(name, None) {
            return Err(NarrativeError::InvalidCharacterName(name.to_string()));
        }
        let project_id = self
            .current_project_id()
            .ok_or(NarrativeError::NoOpenProject)?;

        let character = Character::new(name);
        let id = character.id;
        self.characters.insert(id, character);

        let project = self
            .projects
            .get_mut(&project_id)
            .ok_or(NarrativeError::NoOpenProject)?;
        project.project_characters.insert(id);
        project.active_characters.insert(id);
        project.selected_character = Some(id);

        tracing::debug!(character = %id, name, "Added character");
        Ok(id)
    }

    /// Rename a character
    pub fn rename_character(&mut self, id: CharacterId, name: &str) -> Result<(), NarrativeError> {
        if !self.is_character_name_valid(name, Some(id)) {
            return Err(NarrativeError::InvalidCharacterName(name.to_string()));
        }
        let character = self.character_mut(id)?;
        character.name = name.trim().to_string();
        Ok(())
    }

    /// Replace a character's description
    pub fn set_character_description(
        &mut self,
        id: CharacterId,
        description: impl Into<String>,
    ) -> Result<(), NarrativeError> {
        self.character_mut(id)?.description = description.into();
        Ok(())
    }

    /// Show a character in the current project's detail view
    pub fn select_character(&mut self, id: CharacterId) -> Result<(), NarrativeError> {
        self.character_mut(id)?;
        let project = self
            .current_project_mut()
            .ok_or(NarrativeError::NoOpenProject)?;
        project.selected_character = Some(id);
        Ok(())
    }

    /// Add a character to the scene, or take it out; returns the new state
    ///
    /// Also selects the character. Entering the scene adds the character to
    /// the project.
    pub fn toggle_active(&mut self, id: CharacterId) -> Result<bool, NarrativeError> {
        self.character_mut(id)?;
        let project = self
            .current_project_mut()
            .ok_or(NarrativeError::NoOpenProject)?;
        project.selected_character = Some(id);

        let active = if project.active_characters.remove(&id) {
            false
        } else {
            project.active_characters.insert(id);
            project.project_characters.insert(id);
            true
        };
        Ok(active)
    }

    /// Add a character to the project (and scene), or remove it from both;
    /// returns whether it is now in the project
    pub fn toggle_in_project(&mut self, id: CharacterId) -> Result<bool, NarrativeError> {
        self.character_mut(id)?;
        let project = self
            .current_project_mut()
            .ok_or(NarrativeError::NoOpenProject)?;

        let added = if project.project_characters.remove(&id) {
            project.active_characters.remove(&id);
            false
        } else {
            project.project_characters.insert(id);
            project.active_characters.insert(id);
            true
        };
        Ok(added)
    }

    /// Take a character out of the current project and its scene
    pub fn remove_character_from_project(&mut self, id: CharacterId) -> Result<(), NarrativeError> {
        self.character_mut(id)?;
        let project = self
            .current_project_mut()
            .ok_or(NarrativeError::NoOpenProject)?;
        project.project_characters.remove(&id);
        project.active_characters.remove(&id);
        Ok(())
    }

    /// Delete a character everywhere
    pub fn delete_character(&mut self, id: CharacterId) -> Result<Character, NarrativeError> {
        let character = self
            .characters
            .remove(&id)
            .ok_or_else(|| NarrativeError::UnknownCharacter(id.to_string()))?;
        for project in self.projects.values_mut() {
            project.forget_character(id);
        }
        tracing::debug!(character = %id, name = %character.name, "Deleted character");
        Ok(character)
    }

    /// Search characters for the current project
    ///
    /// An empty query lists the project's own cast. Otherwise every character
    /// whose lower-cased name contains the query matches, and `addable` says
    /// whether the query is free to use as a new name.
    #[must_use]
    pub fn search_characters(&self, query: &str) -> CharacterSearch {
        let Some(project) = self.current_project() else {
            return CharacterSearch::default();
        };
        let entry = |c: &Character| CharacterEntry {
            id: c.id,
            name: c.name.clone(),
            in_project: project.project_characters.contains(&c.id),
            active: project.active_characters.contains(&c.id),
        };

        let query = query.trim();
        if query.is_empty() {
            return CharacterSearch {
                searching: false,
                entries: self.project_cast(project).into_iter().map(entry).collect(),
                addable: false,
            };
        }

        let pattern = contains_pattern(query);
        CharacterSearch {
            searching: true,
            entries: self
                .characters()
                .into_iter()
                .filter(|c| wildcard_match(&pattern, &c.key()))
                .map(entry)
                .collect(),
            addable: self.is_character_name_valid(query, None),
        }
    }

    fn character_mut(&mut self, id: CharacterId) -> Result<&mut Character, NarrativeError> {
        self.characters
            .get_mut(&id)
            .ok_or_else(|| NarrativeError::UnknownCharacter(id.to_string()))
    }
}

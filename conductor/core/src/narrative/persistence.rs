//! JSON save file
//!
//! ```json
//! {
//!     "named_projects": { "dragon saga": { "name": "Dragon Saga", ... } },
//!     "open_projects": ["dragon saga", { "name": "", ... }],
//!     "all_characters": { "alice": { "name": "Alice", "description": "..." } },
//!     "max_tokens": 100,
//!     "temperature": 0.7,
//!     "story_index": 0
//! }
//! ```
//!
//! Named projects are referenced from `open_projects` by lower-cased name;
//! unnamed open projects are stored inline. Projects reference characters by
//! lower-cased name.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::character::{Character, CharacterId};
use super::project::{Project, ProjectId};
use super::registry::ProjectRegistry;

/// Errors reading or writing the save file
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Failed to read the save file
    #[error("failed to read save file {path}: {source}")]
    Read {
        /// Path to the file
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Failed to write the save file
    #[error("failed to write save file {path}: {source}")]
    Write {
        /// Path to the file
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The file is not valid save JSON
    #[error("failed to parse save file {path}: {source}")]
    Parse {
        /// Path to the file
        path: PathBuf,
        /// Underlying JSON error
        source: serde_json::Error,
    },

    /// Serializing the registry failed
    #[error("failed to serialize save data: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A project references a character that does not exist
    #[error("project {project:?} references unknown character {character:?}")]
    UnknownCharacter {
        /// Project name
        project: String,
        /// Character key
        character: String,
    },

    /// `open_projects` names a project missing from `named_projects`
    #[error("open project {0:?} is not a named project")]
    UnknownProject(String),
}

/// Stored character
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterRecord {
    /// Display name
    pub name: String,
    /// Description
    pub description: String,
}

/// Stored project
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Name (empty for unnamed)
    pub name: String,
    /// Memory text
    pub memory: String,
    /// Story text
    pub story: String,
    /// Lower-cased character names
    pub project_characters: Vec<String>,
    /// Lower-cased character names in the scene
    pub active_characters: Vec<String>,
    /// Lower-cased selected character name, or `""`
    pub selected_character: String,
}

/// Entry of `open_projects`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpenProjectRecord {
    /// Reference to a named project
    Named(String),
    /// An unnamed project stored inline
    Inline(ProjectRecord),
}

/// The whole save file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaveFile {
    /// Named projects by lower-cased name
    pub named_projects: BTreeMap<String, ProjectRecord>,
    /// Tabs in order
    pub open_projects: Vec<OpenProjectRecord>,
    /// Characters by lower-cased name
    pub all_characters: BTreeMap<String, CharacterRecord>,
    /// Token budget
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f64,
    /// Current tab
    pub story_index: usize,
}

// ============================================================================
// Registry <-> SaveFile
// ============================================================================

impl ProjectRegistry {
    /// Snapshot the registry in save-file form
    #[must_use]
    pub fn to_save_file(&self) -> SaveFile {
        let key_of = |id: &CharacterId| self.character(*id).map(Character::key);
        let record = |project: &Project| {
            let mut project_characters: Vec<String> =
                project.project_characters.iter().filter_map(key_of).collect();
            let mut active_characters: Vec<String> =
                project.active_characters.iter().filter_map(key_of).collect();
            project_characters.sort();
            active_characters.sort();
            ProjectRecord {
                name: project.name.clone(),
                memory: project.memory.clone(),
                story: project.story.clone(),
                project_characters,
                active_characters,
                selected_character: project
                    .selected_character
                    .as_ref()
                    .and_then(key_of)
                    .unwrap_or_default(),
            }
        };

        SaveFile {
            named_projects: self
                .named_projects()
                .into_iter()
                .map(|p| (p.key(), record(p)))
                .collect(),
            open_projects: self
                .tabs()
                .map(|p| {
                    if p.is_named() {
                        OpenProjectRecord::Named(p.key())
                    } else {
                        OpenProjectRecord::Inline(record(p))
                    }
                })
                .collect(),
            all_characters: self
                .characters()
                .into_iter()
                .map(|c| {
                    (
                        c.key(),
                        CharacterRecord {
                            name: c.name.clone(),
                            description: c.description.clone(),
                        },
                    )
                })
                .collect(),
            max_tokens: self.max_tokens(),
            temperature: self.temperature(),
            story_index: self.current_index(),
        }
    }

    /// Rebuild a registry from a save file
    ///
    /// A save with no open projects gets one empty tab.
    pub fn from_save_file(save: SaveFile) -> Result<Self, PersistenceError> {
        let mut registry = ProjectRegistry::new();
        registry.set_max_tokens(save.max_tokens);
        registry.set_temperature(save.temperature);

        let mut characters: HashMap<String, CharacterId> = HashMap::new();
        for (key, record) in save.all_characters {
            let character = Character::new(record.name).with_description(record.description);
            characters.insert(key.to_lowercase(), character.id);
            registry.insert_character(character);
        }

        let mut named: HashMap<String, ProjectId> = HashMap::new();
        for (key, record) in save.named_projects {
            let project = project_from_record(record, &characters)?;
            named.insert(key.to_lowercase(), project.id);
            registry.insert_project(project);
        }

        for entry in save.open_projects {
            let id = match entry {
                OpenProjectRecord::Named(key) => *named
                    .get(&key.to_lowercase())
                    .ok_or(PersistenceError::UnknownProject(key))?,
                OpenProjectRecord::Inline(record) => {
                    let project = project_from_record(record, &characters)?;
                    let id = project.id;
                    registry.insert_project(project);
                    id
                }
            };
            registry.push_tab(id);
        }

        if registry.tab_count() == 0 {
            registry.new_tab();
        }
        registry.set_current_index(save.story_index);
        Ok(registry)
    }
}

fn project_from_record(
    record: ProjectRecord,
    characters: &HashMap<String, CharacterId>,
) -> Result<Project, PersistenceError> {
    let resolve = |key: &String| {
        characters
            .get(&key.to_lowercase())
            .copied()
            .ok_or_else(|| PersistenceError::UnknownCharacter {
                project: record.name.clone(),
                character: key.clone(),
            })
    };

    let project_characters = record
        .project_characters
        .iter()
        .map(resolve)
        .collect::<Result<_, _>>()?;
    let active_characters = record
        .active_characters
        .iter()
        .map(resolve)
        .collect::<Result<_, _>>()?;
    let selected_character = if record.selected_character.is_empty() {
        None
    } else {
        Some(resolve(&record.selected_character)?)
    };

    Ok(Project {
        id: ProjectId::new(),
        name: record.name,
        memory: record.memory,
        story: record.story,
        project_characters,
        active_characters,
        selected_character,
    })
}

// ============================================================================
// Files
// ============================================================================

/// Load the registry from `path`
///
/// A missing file is not an error: a fresh registry with one empty tab is
/// returned.
pub fn load(path: &Path) -> Result<ProjectRegistry, PersistenceError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "Save file not found, starting fresh");
            return Ok(ProjectRegistry::start_empty());
        }
        Err(source) => {
            return Err(PersistenceError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let save: SaveFile =
        serde_json::from_str(&content).map_err(|source| PersistenceError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    let registry = ProjectRegistry::from_save_file(save)?;

    tracing::info!(
        path = %path.display(),
        tabs = registry.tab_count(),
        characters = registry.characters().len(),
        "Save file loaded"
    );
    Ok(registry)
}

/// Write the registry to `path`
///
/// The file is written next to its destination and renamed into place, so a
/// crash mid-save leaves the previous file intact.
pub fn save(registry: &ProjectRegistry, path: &Path) -> Result<(), PersistenceError> {
    let write_err = |source| PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut bytes = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut bytes, formatter);
    registry.to_save_file().serialize(&mut serializer)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let tmp = temp_path(path);
    let mut file = fs::File::create(&tmp).map_err(write_err)?;
    file.write_all(&bytes).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);
    fs::rename(&tmp, path).map_err(write_err)?;

    tracing::debug!(path = %path.display(), bytes = bytes.len(), "Save file written");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

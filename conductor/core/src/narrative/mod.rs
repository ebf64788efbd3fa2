//! Projects, characters and the save file
//!
//! Everything the writer edits lives in a [`ProjectRegistry`]: the shared
//! character roster, every project (named or not), the open tabs and the
//! generation settings. Identity is by [`ProjectId`]/[`CharacterId`]; names
//! are only used for lookup and in the save file.

mod character;
mod pattern;
mod persistence;
mod project;
mod registry;

pub use character::{Character, CharacterId};
pub use pattern::{contains_pattern, wildcard_match};
pub use persistence::{
    load, save, CharacterRecord, OpenProjectRecord, PersistenceError, ProjectRecord, SaveFile,
};
pub use project::{Project, ProjectId, UNTITLED};
pub use registry::{
    CharacterEntry, CharacterSearch, NarrativeError, ProjectRegistry, DEFAULT_MAX_TOKENS,
    DEFAULT_TEMPERATURE,
};

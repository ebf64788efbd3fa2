//! Storyloom Core - Headless Story-Writing Engine
//!
//! This crate holds everything storyloom does apart from drawing: the
//! projects and characters the writer edits, prompt assembly, the KoboldCpp
//! client and the typing engine that reveals generated text one character at
//! a time. It can drive a terminal REPL, a GUI or run headless in tests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          UI Surface                               │
//! │        method calls (down)        ConductorMessage (up)           │
//! └───────────────┬──────────────────────────────▲───────────────────┘
//!                 │                              │
//! ┌───────────────┼──────────────────────────────┼───────────────────┐
//! │               ▼            STORYLOOM CORE    │                   │
//! │  ┌──────────────────────────────────────────────────────────────┐ │
//! │  │                         Conductor                            │ │
//! │  │  ┌──────────┐  ┌──────────┐  ┌──────────────┐  ┌───────────┐ │ │
//! │  │  │ Project  │  │  Prompt  │  │    Typing    │  │  Backend  │ │ │
//! │  │  │ Registry │  │ Assembly │  │    Engine    │  │ (Kobold)  │ │ │
//! │  │  └──────────┘  └──────────┘  └──────────────┘  └───────────┘ │ │
//! │  └──────────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use storyloom_core::{
//!     backend::KoboldBackend, narrative, CommandType, Conductor, ConductorConfig,
//! };
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (tx, mut rx) = mpsc::unbounded_channel();
//!     let backend = KoboldBackend::new("localhost", 5001)?;
//!     let registry = narrative::load(path)?;
//!     let conductor = Conductor::new(backend, registry, ConductorConfig::default(), tx)?;
//!
//!     conductor.send("open the door", CommandType::Action).await?;
//!     while let Some(msg) = rx.recv().await {
//!         // Render message
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Generation backend abstraction and the KoboldCpp client
//! - [`config`]: TOML, environment and CLI configuration
//! - [`conductor`]: Main Conductor struct
//! - [`messages`]: Messages from Conductor to UI surfaces
//! - [`narrative`]: Projects, characters, tabs and the save file
//! - [`prompt`]: Prompt assembly
//! - [`typing`]: Typewriter pacing engine
//!
//! # No UI Dependencies
//!
//! This crate never prints and has no terminal or GUI dependencies.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod conductor;
pub mod config;
pub mod messages;
pub mod narrative;
pub mod prompt;
pub mod typing;

// Re-exports for convenience
pub use backend::{
    GenerationBackend, GenerationRequest, GenerationResponse, KoboldBackend, SamplerSettings,
    StreamingToken, TokenCount,
};
pub use conductor::{Conductor, ConductorConfig, ConductorError};
pub use messages::{ConductorMessage, ConductorState, NotifyLevel};
pub use prompt::{build_memory, build_request, build_story, CommandType, ParseCommandTypeError};

// Narrative exports
pub use narrative::{
    Character, CharacterId, NarrativeError, PersistenceError, Project, ProjectId, ProjectRegistry,
};

// Typing exports
pub use typing::{
    DisplaySink, SchedulerError, SinkError, TokenBuffer, TypingConfig, TypingPhase,
    TypingScheduler,
};

// Config exports
pub use config::{
    default_config_path, default_save_path, load_config, load_config_from_path,
    load_config_with_env, ConfigError, ConfigOverrides, ConfigSource, StoryloomConfig,
};

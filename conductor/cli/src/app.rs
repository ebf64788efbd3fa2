//! Command dispatch and message rendering
//!
//! [`App`] turns parsed REPL commands into conductor calls and renders
//! [`ConductorMessage`]s as text. Output goes to any [`Write`] so tests can
//! capture it.

use std::fmt::Display;
use std::io::{self, Write};

use storyloom_core::{
    CommandType, Conductor, ConductorError, ConductorMessage, GenerationBackend, NarrativeError,
    ProjectRegistry,
};

use crate::repl::{ReplCommand, HELP};

/// What the REPL loop should do next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading lines
    Continue,
    /// Leave the loop
    Quit,
}

/// Terminal front-end state
pub struct App<B: GenerationBackend + 'static> {
    conductor: Conductor<B>,
    mode: CommandType,
}

impl<B: GenerationBackend + 'static> App<B> {
    /// Wrap a conductor
    pub fn new(conductor: Conductor<B>) -> Self {
        Self {
            conductor,
            mode: CommandType::default(),
        }
    }

    /// The conductor
    pub fn conductor(&self) -> &Conductor<B> {
        &self.conductor
    }

    /// Current entry framing
    pub fn mode(&self) -> CommandType {
        self.mode
    }

    /// Parse and run one input line
    ///
    /// Parse errors and rejected operations are reported on `out`; only
    /// output failures are returned.
    pub async fn handle_line(&mut self, line: &str, out: &mut impl Write) -> io::Result<Flow> {
        match ReplCommand::parse(line) {
            Ok(command) => self.dispatch(command, out).await,
            Err(e) => {
                writeln!(out, "{e}")?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Run one command
    pub async fn dispatch(&mut self, command: ReplCommand, out: &mut impl Write) -> io::Result<Flow> {
        tracing::debug!(?command, "Dispatching command");
        match command {
            ReplCommand::Prompt(entry) => match self.conductor.send(&entry, self.mode).await {
                Ok(()) => {}
                Err(ConductorError::AlreadyGenerating) => {
                    writeln!(out, "Still writing. Use /abort to stop.")?;
                }
                Err(e) => writeln!(out, "{e}")?,
            },
            ReplCommand::Abort => {
                if !self.conductor.abort().await {
                    writeln!(out, "Nothing to abort.")?;
                }
            }
            ReplCommand::Mode(mode) => {
                self.mode = mode;
                writeln!(out, "Entries are framed as `{}`.", mode.prefix())?;
            }
            ReplCommand::Tabs => self.print_tabs(out)?,
            ReplCommand::New => {
                let index = self.conductor.new_tab();
                report(out, self.conductor.select_tab(index))?;
            }
            ReplCommand::Tab(index) => {
                tab_report(out, self.conductor.select_tab(index))?;
            }
            ReplCommand::Close(index) => {
                tab_report(out, self.conductor.close_tab(index))?;
            }
            ReplCommand::Rename(name) => {
                let result = self
                    .conductor
                    .with_registry(|r| r.rename_project(r.current_index(), &name));
                if report(out, result)? {
                    writeln!(out, "Project renamed to {name}.")?;
                }
            }
            ReplCommand::Memory(text) => {
                let result = self.conductor.with_registry(|r| {
                    let project = r.current_project_mut().ok_or(NarrativeError::NoOpenProject)?;
                    project.memory = text;
                    Ok::<_, NarrativeError>(())
                });
                report(out, result)?;
            }
            ReplCommand::Story => {
                let story = self
                    .conductor
                    .with_registry(|r| r.current_project().map(|p| p.story.clone()));
                writeln!(out, "{}", story.unwrap_or_default())?;
            }
            ReplCommand::Chars(query) => self.print_characters(query.as_deref(), out)?,
            ReplCommand::AddChar(name) => {
                let result = self.conductor.with_registry(|r| r.add_character(&name));
                if report(out, result)? {
                    writeln!(out, "{name} joins the scene.")?;
                }
            }
            ReplCommand::Describe { name, text } => {
                let result = self.conductor.with_registry(|r| {
                    let id = character_id(r, &name)?;
                    r.set_character_description(id, &text)
                });
                report(out, result)?;
            }
            ReplCommand::Toggle(name) => {
                let result = self.conductor.with_registry(|r| {
                    let id = character_id(r, &name)?;
                    r.toggle_active(id)
                });
                match result {
                    Ok(true) => writeln!(out, "{name} enters the scene.")?,
                    Ok(false) => writeln!(out, "{name} leaves the scene.")?,
                    Err(e) => writeln!(out, "{e}")?,
                }
            }
            ReplCommand::Projects(query) => {
                let names = self.conductor.with_registry(|r| {
                    r.search_projects(query.as_deref().unwrap_or_default())
                        .into_iter()
                        .map(|p| p.display_name().to_string())
                        .collect::<Vec<_>>()
                });
                if names.is_empty() {
                    writeln!(out, "No saved projects.")?;
                }
                for name in names {
                    writeln!(out, "  {name}")?;
                }
            }
            ReplCommand::Open(name) => {
                report(out, self.conductor.open_project(&name))?;
            }
            ReplCommand::MaxTokens(n) => {
                self.conductor.with_registry(|r| r.set_max_tokens(n));
                writeln!(out, "Max tokens set to {n}.")?;
            }
            ReplCommand::Temperature(t) => {
                let t = self.conductor.with_registry(|r| {
                    r.set_temperature(t);
                    r.temperature()
                });
                writeln!(out, "Temperature set to {t}.")?;
            }
            ReplCommand::Save => {
                if report(out, self.conductor.save())? {
                    writeln!(out, "Saved.")?;
                }
            }
            ReplCommand::Help => writeln!(out, "{HELP}")?,
            ReplCommand::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    /// Render a conductor message
    pub fn render(&self, message: &ConductorMessage, out: &mut impl Write) -> io::Result<()> {
        match message {
            ConductorMessage::StoryText { text, .. } => {
                write!(out, "{text}")?;
                out.flush()?;
            }
            ConductorMessage::Generating { active: false } => writeln!(out)?,
            ConductorMessage::GenerationFailed { error, .. } => {
                writeln!(out, "[generation failed: {error}]")?;
            }
            ConductorMessage::TabSelected { index, project } => {
                let name = self.conductor.with_registry(|r| {
                    r.project(*project)
                        .map(|p| p.display_name().to_string())
                        .unwrap_or_default()
                });
                writeln!(out, "[tab {}: {name}]", index + 1)?;
            }
            ConductorMessage::Notify { level, message } => writeln!(out, "[{level:?}] {message}")?,
            ConductorMessage::StoryReplaced { .. }
            | ConductorMessage::StoryLocked { .. }
            | ConductorMessage::Generating { active: true }
            | ConductorMessage::State { .. } => {}
        }
        Ok(())
    }

    /// Stop typing and save
    pub fn shutdown(mut self) -> Result<(), ConductorError> {
        self.conductor.shutdown()
    }

    fn print_tabs(&self, out: &mut impl Write) -> io::Result<()> {
        let generating = self.conductor.generating_project();
        let rows = self.conductor.with_registry(|r| {
            let current = r.current_index();
            r.tabs()
                .enumerate()
                .map(|(i, p)| {
                    let marker = if i == current { '*' } else { ' ' };
                    let busy = if generating == Some(p.id) { " (writing)" } else { "" };
                    format!("{marker} {}. {}{busy}", i + 1, p.display_name())
                })
                .collect::<Vec<_>>()
        });
        for row in rows {
            writeln!(out, "{row}")?;
        }
        Ok(())
    }

    fn print_characters(&self, query: Option<&str>, out: &mut impl Write) -> io::Result<()> {
        let query = query.unwrap_or_default();
        let search = self.conductor.with_registry(|r| r.search_characters(query));
        if search.entries.is_empty() && !search.searching {
            writeln!(out, "No characters in this project.")?;
        }
        for entry in &search.entries {
            let place = match (entry.active, entry.in_project) {
                (true, _) => "in scene",
                (false, true) => "in project",
                (false, false) => "",
            };
            writeln!(out, "  {:<20} {place}", entry.name)?;
        }
        if search.addable {
            writeln!(out, "  (/addchar {} to create)", query.trim())?;
        }
        Ok(())
    }
}

fn character_id(
    registry: &ProjectRegistry,
    name: &str,
) -> Result<storyloom_core::CharacterId, NarrativeError> {
    registry
        .find_character(name)
        .map(|c| c.id)
        .ok_or_else(|| NarrativeError::UnknownCharacter(name.to_string()))
}

/// Like [`report`], with tab errors in the 1-based numbering the user typed
fn tab_report<T>(out: &mut impl Write, result: Result<T, ConductorError>) -> io::Result<bool> {
    match result {
        Err(ConductorError::Narrative(NarrativeError::TabOutOfRange { index, len })) => {
            writeln!(out, "No tab {} ({len} open).", index + 1)?;
            Ok(false)
        }
        other => report(out, other),
    }
}

/// Print the error, if any; returns whether the operation succeeded
fn report<T, E: Display>(out: &mut impl Write, result: Result<T, E>) -> io::Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) => {
            writeln!(out, "{e}")?;
            Ok(false)
        }
    }
}

//! Conductor - The Application Core
//!
//! The Conductor wires the pieces together:
//! - the [`ProjectRegistry`] the writer edits
//! - the generation backend
//! - the typing engine ([`TokenBuffer`] + [`TypingScheduler`])
//! - the UI surface, reached through [`ConductorMessage`]s
//!
//! The Conductor is UI-agnostic: the terminal front-end, a GUI or a test
//! harness all drive it through the same methods and render the same
//! messages.
//!
//! # Generation flow
//!
//! ```text
//! send() ─► build prompt ─► story replaced, area locked ─► backend stream
//!                                                              │
//!             StorySink ◄── TypingScheduler ◄── TokenBuffer ◄──┘ (producer task)
//!                 │
//!                 └─► generating project's story += text, StoryText if current
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::backend::GenerationBackend;
use crate::messages::{ConductorMessage, ConductorState, NotifyLevel};
use crate::narrative::{self, NarrativeError, PersistenceError, ProjectId, ProjectRegistry};
use crate::prompt::{build_request, CommandType};
use crate::typing::{
    forward_stream, DisplaySink, SchedulerError, SinkError, TokenBuffer, TypingConfig,
    TypingScheduler,
};

/// Errors from conductor operations
#[derive(Debug, Error)]
pub enum ConductorError {
    /// A generation is already running
    #[error("a generation is already in progress")]
    AlreadyGenerating,

    /// Registry operation failed
    #[error(transparent)]
    Narrative(#[from] NarrativeError),

    /// Saving failed
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The typing thread failed
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Conductor configuration
#[derive(Clone, Debug, Default)]
pub struct ConductorConfig {
    /// Typing engine tunables
    pub typing: TypingConfig,
    /// Where `save()` writes (None = saving disabled)
    pub save_path: Option<PathBuf>,
}

impl ConductorConfig {
    /// Set the typing tunables
    #[must_use]
    pub fn with_typing(mut self, typing: TypingConfig) -> Self {
        self.typing = typing;
        self
    }

    /// Set the save path
    #[must_use]
    pub fn with_save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }
}

// ============================================================================
// Story sink
// ============================================================================

/// Display sink that writes revealed text into the generating project
struct StorySink {
    registry: Arc<Mutex<ProjectRegistry>>,
    generating: Arc<Mutex<Option<ProjectId>>>,
    tx: mpsc::UnboundedSender<ConductorMessage>,
    /// Project whose generation just ended, for failure reports
    finished: Option<ProjectId>,
}

impl StorySink {
    fn emit(&self, message: ConductorMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Surface gone, dropping message");
        }
    }
}

impl DisplaySink for StorySink {
    fn reveal(&mut self, text: &str, is_terminal: bool) -> Result<(), SinkError> {
        let project = *self.generating.lock();
        let Some(project) = project else {
            tracing::warn!(len = text.len(), "Revealed text with no generating project");
            return Ok(());
        };

        let is_current = {
            let mut registry = self.registry.lock();
            match registry.project_mut(project) {
                Some(p) => p.story.push_str(text),
                None => tracing::debug!(project = %project, "Generating project was closed"),
            }
            registry.current_project_id() == Some(project)
        };

        if is_current && !text.is_empty() {
            self.emit(ConductorMessage::StoryText {
                project,
                text: text.to_string(),
            });
        }

        if is_terminal {
            *self.generating.lock() = None;
            self.finished = Some(project);
            self.emit(ConductorMessage::Generating { active: false });
            if is_current {
                self.emit(ConductorMessage::StoryLocked { locked: false });
            }
            self.emit(ConductorMessage::State {
                state: ConductorState::Ready,
            });
            tracing::info!(project = %project, "Generation finished");
        }
        Ok(())
    }

    fn generation_failed(&mut self, reason: &str) -> Result<(), SinkError> {
        if let Some(project) = self.finished {
            self.emit(ConductorMessage::GenerationFailed {
                project,
                error: reason.to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Conductor
// ============================================================================

/// The Conductor - headless application core
pub struct Conductor<B: GenerationBackend> {
    /// Generation backend
    backend: Arc<B>,
    /// Projects and characters
    registry: Arc<Mutex<ProjectRegistry>>,
    /// Project receiving the current generation
    generating: Arc<Mutex<Option<ProjectId>>>,
    /// Shared stream state
    buffer: TokenBuffer,
    /// Typing thread (None after shutdown)
    scheduler: Option<TypingScheduler>,
    /// Channel to the UI surface
    tx: mpsc::UnboundedSender<ConductorMessage>,
    /// Save file location
    save_path: Option<PathBuf>,
}

impl<B: GenerationBackend + 'static> Conductor<B> {
    /// Create a Conductor and start its typing thread
    pub fn new(
        backend: B,
        registry: ProjectRegistry,
        config: ConductorConfig,
        tx: mpsc::UnboundedSender<ConductorMessage>,
    ) -> Result<Self, ConductorError> {
        let registry = Arc::new(Mutex::new(registry));
        let generating = Arc::new(Mutex::new(None));
        let buffer = TokenBuffer::new();

        let sink = StorySink {
            registry: Arc::clone(&registry),
            generating: Arc::clone(&generating),
            tx: tx.clone(),
            finished: None,
        };
        let scheduler = TypingScheduler::spawn(buffer.clone(), sink, config.typing)?;

        tracing::info!(backend = backend.name(), "Conductor started");

        Ok(Self {
            backend: Arc::new(backend),
            registry,
            generating,
            buffer,
            scheduler: Some(scheduler),
            tx,
            save_path: config.save_path,
        })
    }

    /// The generation backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The typing engine's buffer
    pub fn buffer(&self) -> &TokenBuffer {
        &self.buffer
    }

    /// Run `f` with the registry locked
    ///
    /// Do not call back into the Conductor from `f`.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut ProjectRegistry) -> R) -> R {
        f(&mut self.registry.lock())
    }

    /// Whether a generation is running
    pub fn is_generating(&self) -> bool {
        self.generating.lock().is_some()
    }

    /// Project receiving the current generation
    pub fn generating_project(&self) -> Option<ProjectId> {
        *self.generating.lock()
    }

    /// Continue the current project's story
    ///
    /// The entry is framed with `command`, appended to the story and the
    /// backend stream is started. A backend that fails to start ends the
    /// generation through the typing engine, so the surface still sees the
    /// story unlock and a `GenerationFailed` message.
    pub async fn send(&self, entry: &str, command: CommandType) -> Result<(), ConductorError> {
        let (project, request) = {
            let mut generating = self.generating.lock();
            if generating.is_some() {
                return Err(ConductorError::AlreadyGenerating);
            }

            let mut registry = self.registry.lock();
            let project = registry
                .current_project()
                .ok_or(NarrativeError::NoOpenProject)?;
            let request = build_request(&registry, project, entry, command);
            let id = project.id;
            if let Some(project) = registry.project_mut(id) {
                project.story = request.prompt.clone();
            }
            *generating = Some(id);
            (id, request)
        };

        tracing::info!(
            project = %project,
            command = %command,
            max_length = request.max_length,
            "Starting generation"
        );

        self.emit(ConductorMessage::StoryReplaced {
            project,
            story: request.prompt.clone(),
        });
        self.emit(ConductorMessage::StoryLocked { locked: true });
        self.emit(ConductorMessage::Generating { active: true });
        self.emit(ConductorMessage::State {
            state: ConductorState::Generating,
        });

        self.buffer.begin();
        match self.backend.send_streaming(&request).await {
            Ok(rx) => {
                tokio::spawn(forward_stream(rx, self.buffer.clone()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Backend failed to start generation");
                self.buffer.finish_with_error(e.to_string());
            }
        }
        Ok(())
    }

    /// Stop the current generation
    ///
    /// Everything received so far is revealed at once. Returns `false` when
    /// nothing was generating.
    pub async fn abort(&self) -> bool {
        if !self.buffer.request_abort() {
            return false;
        }
        self.emit(ConductorMessage::State {
            state: ConductorState::Aborting,
        });
        if let Err(e) = self.backend.abort().await {
            tracing::warn!(error = %e, "Backend abort failed");
        }
        true
    }

    /// Switch tabs
    ///
    /// The story area is unlocked when leaving the generating project and
    /// locked again when returning to it.
    pub fn select_tab(&self, index: usize) -> Result<ProjectId, ConductorError> {
        let (leaving, project) = {
            let mut registry = self.registry.lock();
            let leaving = registry.current_project_id();
            let project = registry.select_tab(index)?.id;
            (leaving, project)
        };
        self.announce_switch(leaving);
        Ok(project)
    }

    /// Open a new unnamed project in a new tab; returns its index
    ///
    /// The current tab does not change.
    pub fn new_tab(&self) -> usize {
        self.registry.lock().new_tab()
    }

    /// Close a tab
    ///
    /// Text still arriving for a closed unnamed project is dropped.
    pub fn close_tab(&self, index: usize) -> Result<ProjectId, ConductorError> {
        let (leaving, closed) = {
            let mut registry = self.registry.lock();
            let leaving = registry.current_project_id();
            (leaving, registry.close_tab(index)?)
        };
        self.announce_switch(leaving);
        Ok(closed)
    }

    /// Open a named project (or switch to its tab); returns the tab index
    pub fn open_project(&self, name: &str) -> Result<usize, ConductorError> {
        let (leaving, index) = {
            let mut registry = self.registry.lock();
            let leaving = registry.current_project_id();
            (leaving, registry.open_project_by_name(name)?)
        };
        self.announce_switch(leaving);
        Ok(index)
    }

    /// Tell the surface which tab is current, fixing the story lock when the
    /// generating project comes into or goes out of view
    fn announce_switch(&self, leaving: Option<ProjectId>) {
        let generating = *self.generating.lock();
        let (index, project) = {
            let registry = self.registry.lock();
            (registry.current_index(), registry.current_project_id())
        };
        let Some(project) = project else {
            return;
        };

        let moved = leaving != Some(project);
        if moved && generating.is_some() && generating == leaving {
            self.emit(ConductorMessage::StoryLocked { locked: false });
        }
        self.emit(ConductorMessage::TabSelected { index, project });
        if moved && generating == Some(project) {
            self.emit(ConductorMessage::StoryLocked { locked: true });
        }
    }

    /// Write the registry to the save file
    pub fn save(&self) -> Result<(), ConductorError> {
        let Some(path) = &self.save_path else {
            tracing::debug!("No save path configured, skipping save");
            return Ok(());
        };
        narrative::save(&self.registry.lock(), path)?;
        tracing::info!(path = %path.display(), "Saved");
        Ok(())
    }

    /// Stop typing and save
    ///
    /// Text not yet revealed is dropped.
    pub fn shutdown(&mut self) -> Result<(), ConductorError> {
        self.emit(ConductorMessage::State {
            state: ConductorState::ShuttingDown,
        });
        let typing = match self.scheduler.take() {
            Some(scheduler) => scheduler.shutdown(),
            None => Ok(()),
        };
        self.save()?;
        typing?;
        Ok(())
    }

    /// Send a notification to the surface
    pub fn notify(&self, level: NotifyLevel, message: impl Into<String>) {
        self.emit(ConductorMessage::Notify {
            level,
            message: message.into(),
        });
    }

    /// Send a message to the UI surface
    fn emit(&self, msg: ConductorMessage) {
        if let Err(e) = self.tx.send(msg) {
            tracing::warn!("Failed to send message to surface: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GenerationRequest, GenerationResponse, StreamingToken, TokenCount};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // Scripted backend for testing
    #[derive(Default)]
    struct ScriptedBackend {
        script: Vec<StreamingToken>,
        fail_start: bool,
        /// Keep the stream open after the script until abort
        hold_open: bool,
        open: Mutex<Option<mpsc::Sender<StreamingToken>>>,
        aborts: AtomicUsize,
    }

    impl ScriptedBackend {
        fn with_script(script: &[(&str, bool)]) -> Self {
            Self {
                script: script
                    .iter()
                    .map(|(text, is_final)| StreamingToken::Fragment {
                        text: (*text).to_string(),
                        is_final: *is_final,
                    })
                    .collect(),
                ..Default::default()
            }
        }

        fn held_open() -> Self {
            Self {
                hold_open: true,
                ..Default::default()
            }
        }

        fn stream(&self) -> mpsc::Sender<StreamingToken> {
            self.open.lock().clone().expect("no open stream")
        }
    }

    #[async_trait::async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "Scripted"
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn send_streaming(
            &self,
            _request: &GenerationRequest,
        ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
            if self.fail_start {
                anyhow::bail!("connection refused");
            }
            let (tx, rx) = mpsc::channel(64);
            for token in &self.script {
                tx.try_send(token.clone())?;
            }
            if self.hold_open {
                *self.open.lock() = Some(tx);
            }
            Ok(rx)
        }

        async fn send(&self, _request: &GenerationRequest) -> anyhow::Result<GenerationResponse> {
            Ok(GenerationResponse {
                text: String::new(),
                duration_ms: None,
            })
        }

        async fn check_progress(&self) -> anyhow::Result<String> {
            Ok(String::new())
        }

        async fn abort(&self) -> anyhow::Result<()> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            self.open.lock().take();
            Ok(())
        }

        async fn token_count(&self, _text: &str) -> anyhow::Result<TokenCount> {
            Ok(TokenCount::default())
        }

        async fn detokenize(&self, _ids: &[u32]) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    fn conductor<B: GenerationBackend + 'static>(
        backend: B,
        registry: ProjectRegistry,
    ) -> (Conductor<B>, mpsc::UnboundedReceiver<ConductorMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ConductorConfig::default()
            .with_typing(TypingConfig::default().with_base_time(Duration::from_millis(5)));
        (Conductor::new(backend, registry, config, tx).unwrap(), rx)
    }

    /// Collect messages up to and including the first one matching `done`
    async fn collect_until(
        rx: &mut mpsc::UnboundedReceiver<ConductorMessage>,
        done: impl Fn(&ConductorMessage) -> bool,
    ) -> Vec<ConductorMessage> {
        let mut messages = Vec::new();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for conductor")
                .expect("conductor channel closed");
            let stop = done(&msg);
            messages.push(msg);
            if stop {
                return messages;
            }
        }
    }

    fn finished(msg: &ConductorMessage) -> bool {
        matches!(msg, ConductorMessage::Generating { active: false })
    }

    fn story_text(messages: &[ConductorMessage]) -> String {
        messages
            .iter()
            .filter_map(|m| match m {
                ConductorMessage::StoryText { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_send_types_generation_into_story() {
        let mut registry = ProjectRegistry::start_empty();
        registry.current_project_mut().unwrap().story = "The gate opens.".to_string();
        let backend = ScriptedBackend::with_script(&[("Hello", false), (" world", true)]);
        let (conductor, mut rx) = conductor(backend, registry);

        conductor.send("look around", CommandType::You).await.unwrap();
        let messages = collect_until(&mut rx, finished).await;

        let expected_prompt = "The gate opens.\n\nYou: look around\n\n";
        assert!(matches!(
            &messages[0],
            ConductorMessage::StoryReplaced { story, .. } if story == expected_prompt
        ));
        assert_eq!(messages[1], ConductorMessage::StoryLocked { locked: true });
        assert_eq!(messages[2], ConductorMessage::Generating { active: true });
        assert_eq!(story_text(&messages), "Hello world");

        let next = collect_until(&mut rx, |m| {
            matches!(m, ConductorMessage::StoryLocked { locked: false })
        })
        .await;
        assert_eq!(next.len(), 1);

        let story = conductor.with_registry(|r| r.current_project().unwrap().story.clone());
        assert_eq!(story, format!("{expected_prompt}Hello world"));
        assert!(!conductor.is_generating());
    }

    #[tokio::test]
    async fn test_second_send_while_generating_is_rejected() {
        let (conductor, mut rx) = conductor(ScriptedBackend::held_open(), ProjectRegistry::start_empty());

        conductor.send("first", CommandType::You).await.unwrap();
        assert!(matches!(
            conductor.send("second", CommandType::You).await,
            Err(ConductorError::AlreadyGenerating)
        ));

        assert!(conductor.abort().await);
        assert_eq!(conductor.backend().aborts.load(Ordering::SeqCst), 1);
        collect_until(&mut rx, finished).await;
        assert!(!conductor.is_generating());
    }

    #[tokio::test]
    async fn test_abort_flushes_pending_text() {
        let (conductor, mut rx) = conductor(ScriptedBackend::held_open(), ProjectRegistry::start_empty());
        conductor.send("", CommandType::Action).await.unwrap();

        let stream = conductor.backend().stream();
        stream
            .send(StreamingToken::Fragment {
                text: "a long passage of text".to_string(),
                is_final: false,
            })
            .await
            .unwrap();
        drop(stream);
        collect_until(&mut rx, |m| matches!(m, ConductorMessage::StoryText { .. })).await;

        assert!(conductor.abort().await);
        let messages = collect_until(&mut rx, finished).await;

        let story = conductor.with_registry(|r| r.current_project().unwrap().story.clone());
        assert_eq!(story, "a long passage of text");
        assert!(messages
            .iter()
            .any(|m| matches!(m, ConductorMessage::State { state: ConductorState::Aborting })));
    }

    #[tokio::test]
    async fn test_abort_when_idle_is_noop() {
        let (conductor, _rx) = conductor(ScriptedBackend::default(), ProjectRegistry::start_empty());
        assert!(!conductor.abort().await);
        assert_eq!(conductor.backend().aborts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_start_failure_unlocks_story() {
        let backend = ScriptedBackend {
            fail_start: true,
            ..Default::default()
        };
        let (conductor, mut rx) = conductor(backend, ProjectRegistry::start_empty());

        conductor.send("hello", CommandType::You).await.unwrap();
        let messages = collect_until(&mut rx, |m| {
            matches!(m, ConductorMessage::GenerationFailed { .. })
        })
        .await;

        assert!(messages.contains(&ConductorMessage::Generating { active: false }));
        assert!(messages.contains(&ConductorMessage::StoryLocked { locked: false }));
        assert!(matches!(
            messages.last(),
            Some(ConductorMessage::GenerationFailed { error, .. }) if error.contains("connection refused")
        ));
    }

    #[tokio::test]
    async fn test_text_follows_generating_project_across_tabs() {
        let mut registry = ProjectRegistry::start_empty();
        registry.new_tab();
        let (conductor, mut rx) = conductor(ScriptedBackend::held_open(), registry);

        conductor.send("", CommandType::You).await.unwrap();
        let generating = conductor.generating_project().unwrap();
        collect_until(&mut rx, |m| matches!(m, ConductorMessage::State { .. })).await;

        let other = conductor.select_tab(1).unwrap();
        assert_ne!(other, generating);
        let switched = collect_until(&mut rx, |m| {
            matches!(m, ConductorMessage::TabSelected { .. })
        })
        .await;
        assert_eq!(
            switched,
            vec![
                ConductorMessage::StoryLocked { locked: false },
                ConductorMessage::TabSelected {
                    index: 1,
                    project: other
                },
            ]
        );

        conductor
            .backend()
            .stream()
            .send(StreamingToken::Fragment {
                text: "abc".to_string(),
                is_final: true,
            })
            .await
            .unwrap();
        let messages = collect_until(&mut rx, |m| matches!(m, ConductorMessage::State { state: ConductorState::Ready })).await;

        assert_eq!(story_text(&messages), "");
        assert!(!messages.contains(&ConductorMessage::StoryLocked { locked: false }));
        let story = conductor.with_registry(|r| r.project(generating).unwrap().story.clone());
        assert_eq!(story, "abc");

        conductor.select_tab(0).unwrap();
    }

    #[tokio::test]
    async fn test_returning_to_generating_tab_relocks() {
        let mut registry = ProjectRegistry::start_empty();
        registry.new_tab();
        let (conductor, mut rx) = conductor(ScriptedBackend::held_open(), registry);

        conductor.send("", CommandType::You).await.unwrap();
        collect_until(&mut rx, |m| matches!(m, ConductorMessage::State { .. })).await;

        conductor.select_tab(1).unwrap();
        let generating = conductor.select_tab(0).unwrap();
        let messages = collect_until(&mut rx, |m| {
            matches!(m, ConductorMessage::TabSelected { index: 0, .. })
        })
        .await;
        assert!(matches!(
            rx.recv().await,
            Some(ConductorMessage::StoryLocked { locked: true })
        ));
        assert_eq!(messages.len(), 3);
        assert_eq!(conductor.generating_project(), Some(generating));
    }

    #[tokio::test]
    async fn test_closing_generating_tab_unlocks() {
        let mut registry = ProjectRegistry::start_empty();
        registry.new_tab();
        let (conductor, mut rx) = conductor(ScriptedBackend::held_open(), registry);

        conductor.send("", CommandType::You).await.unwrap();
        collect_until(&mut rx, |m| matches!(m, ConductorMessage::State { .. })).await;

        let closed = conductor.close_tab(0).unwrap();
        assert_eq!(Some(closed), conductor.generating_project());
        let messages = collect_until(&mut rx, |m| {
            matches!(m, ConductorMessage::TabSelected { .. })
        })
        .await;
        assert_eq!(messages[0], ConductorMessage::StoryLocked { locked: false });
        assert!(matches!(
            messages[1],
            ConductorMessage::TabSelected { index: 0, .. }
        ));

        // The closed project was unnamed, so its text goes nowhere
        conductor
            .backend()
            .stream()
            .send(StreamingToken::Fragment {
                text: "lost".to_string(),
                is_final: true,
            })
            .await
            .unwrap();
        let messages = collect_until(&mut rx, finished).await;
        assert_eq!(story_text(&messages), "");
        assert_eq!(conductor.with_registry(|r| r.tab_count()), 1);
    }

    #[tokio::test]
    async fn test_shutdown_saves_registry() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("save.json");
        let mut registry = ProjectRegistry::start_empty();
        registry.rename_project(0, "Kept").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let config = ConductorConfig::default().with_save_path(&path);
        let mut conductor = Conductor::new(ScriptedBackend::default(), registry, config, tx).unwrap();
        conductor.shutdown().unwrap();

        let loaded = narrative::load(&path).unwrap();
        assert!(loaded.find_project("kept").is_some());
    }
}

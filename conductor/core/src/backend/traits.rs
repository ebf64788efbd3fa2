//! Generation backend traits
//!
//! The conductor talks to text-generation services through
//! [`GenerationBackend`]. Implementations own the wire format; the rest of
//! the crate only sees [`GenerationRequest`] going out and
//! [`StreamingToken`]s coming back.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Token stream events from a generation backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingToken {
    /// A piece of generated text
    Fragment {
        /// The text (may be empty on the final event)
        text: String,
        /// Whether this is the last fragment of the generation
        is_final: bool,
    },
    /// The stream failed; no further tokens follow
    Error(String),
}

/// A single generation request
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    /// Story text to continue
    pub prompt: String,
    /// Context kept in front of the prompt
    pub memory: String,
    /// Maximum tokens to generate
    pub max_length: u32,
    /// Sampling temperature
    pub temperature: f64,
    /// Generation stops when any of these is produced
    pub stop_sequence: Vec<String>,
    /// GBNF grammar (empty = none)
    pub grammar: String,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            memory: String::new(),
            max_length: 100,
            temperature: 0.7,
            stop_sequence: Vec::new(),
            grammar: String::new(),
        }
    }
}

impl GenerationRequest {
    /// Create a request for the given prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Set memory
    #[must_use]
    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = memory.into();
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set stop sequences
    #[must_use]
    pub fn with_stop_sequence(mut self, stop: Vec<String>) -> Self {
        self.stop_sequence = stop;
        self
    }

    /// Set grammar
    #[must_use]
    pub fn with_grammar(mut self, grammar: impl Into<String>) -> Self {
        self.grammar = grammar.into();
        self
    }
}

/// Response from a non-streaming request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationResponse {
    /// Generated text
    pub text: String,
    /// Wall time in milliseconds
    pub duration_ms: Option<u64>,
}

/// Tokenizer output
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenCount {
    /// Number of tokens
    pub value: usize,
    /// Token ids
    pub ids: Vec<u32>,
}

/// Generation backend trait
///
/// Implement this to drive the conductor from a different service (or from a
/// scripted backend in tests).
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Check if the backend is reachable
    async fn health_check(&self) -> bool;

    /// Start a streaming generation
    ///
    /// The receiver yields fragments until one is final or an error is sent.
    async fn send_streaming(
        &self,
        request: &GenerationRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>>;

    /// Generate and wait for the whole text
    async fn send(&self, request: &GenerationRequest) -> anyhow::Result<GenerationResponse>;

    /// Text generated so far by the current generation
    async fn check_progress(&self) -> anyhow::Result<String>;

    /// Ask the service to stop the current generation
    ///
    /// Best effort: the local abort flag is what actually stops typing.
    async fn abort(&self) -> anyhow::Result<()>;

    /// Tokenize `text`
    async fn token_count(&self, text: &str) -> anyhow::Result<TokenCount>;

    /// Turn token ids back into text
    async fn detokenize(&self, ids: &[u32]) -> anyhow::Result<String>;
}

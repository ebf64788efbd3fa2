//! Generation backend integration
//!
//! Text generation goes through the [`GenerationBackend`] trait. The shipped
//! implementation talks to a local KoboldCpp server.
//!
//! # Usage
//!
//! ```ignore
//! use storyloom_core::backend::{GenerationBackend, GenerationRequest, KoboldBackend};
//!
//! let backend = KoboldBackend::new("localhost", 5001)?;
//! let request = GenerationRequest::new("Once upon a time").with_max_length(100);
//! let rx = backend.send_streaming(&request).await?;
//! ```

mod kobold;
mod sse;
mod traits;

pub use kobold::{new_genkey, KoboldBackend, SamplerSettings, DEFAULT_HOST, DEFAULT_PORT};
pub use traits::{
    GenerationBackend, GenerationRequest, GenerationResponse, StreamingToken, TokenCount,
};

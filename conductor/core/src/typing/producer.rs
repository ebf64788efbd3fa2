//! Adapter from a backend token stream to a [`TokenBuffer`].

use tokio::sync::mpsc;

use super::state::TokenBuffer;
use crate::backend::StreamingToken;

/// Feed every token from `rx` into `buffer` until the stream ends
///
/// Errors, and channels that close before a final fragment, end the
/// generation through [`TokenBuffer::finish_with_error`] so the display still
/// gets its terminal reveal.
pub async fn forward_stream(mut rx: mpsc::Receiver<StreamingToken>, buffer: TokenBuffer) {
    let mut fragments = 0usize;

    while let Some(token) = rx.recv().await {
        match token {
            StreamingToken::Fragment { text, is_final } => {
                fragments += 1;
                buffer.append(&text, is_final);
                if is_final {
                    tracing::debug!(fragments, "Backend stream finished");
                    return;
                }
            }
            StreamingToken::Error(reason) => {
                tracing::warn!(fragments, reason = %reason, "Backend stream failed");
                buffer.finish_with_error(reason);
                return;
            }
        }
    }

    tracing::warn!(fragments, "Backend stream closed without a final fragment");
    buffer.finish_with_error("backend stream closed unexpectedly");
}

//! KoboldCpp backend
//!
//! # KoboldCpp API
//!
//! - `/api/extra/generate/stream` - streaming generation (server-sent events)
//! - `/api/v1/generate` - blocking generation
//! - `/api/extra/generate/check` - partial output of a running generation
//! - `/api/extra/abort` - stop a running generation
//! - `/api/extra/tokencount`, `/api/extra/detokenize` - tokenizer
//!
//! Every generation carries a `genkey` so check and abort hit the right job on
//! a shared server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::sse::SseDecoder;
use super::traits::{
    GenerationBackend, GenerationRequest, GenerationResponse, StreamingToken, TokenCount,
};

/// Default KoboldCpp host
pub const DEFAULT_HOST: &str = "localhost";
/// Default KoboldCpp port
pub const DEFAULT_PORT: u16 = 5001;

const GENKEY_CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const GENKEY_LEN: usize = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sampler parameters sent with every generation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    /// Number of completions
    pub n: u32,
    /// Context window in tokens
    pub max_context_length: u32,
    /// Repetition penalty
    pub rep_pen: f64,
    /// Nucleus sampling
    pub top_p: f64,
    /// Top-k sampling (0 = off)
    pub top_k: u32,
    /// Top-a sampling (0 = off)
    pub top_a: f64,
    /// Typical sampling (1 = off)
    pub typical: f64,
    /// Tail-free sampling (1 = off)
    pub tfs: f64,
    /// Tokens covered by the repetition penalty
    pub rep_pen_range: u32,
    /// Repetition penalty slope
    pub rep_pen_slope: f64,
    /// Sampler application order
    pub sampler_order: Vec<u8>,
    /// Keep the server console quiet
    pub quiet: bool,
    /// Ban the model's default bad words
    pub use_default_badwordsids: bool,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            n: 1,
            max_context_length: 2048,
            rep_pen: 1.1,
            top_p: 0.92,
            top_k: 0,
            top_a: 0.0,
            typical: 1.0,
            tfs: 1.0,
            rep_pen_range: 320,
            rep_pen_slope: 0.7,
            sampler_order: vec![6, 0, 1, 3, 4, 2, 5],
            quiet: true,
            use_default_badwordsids: false,
        }
    }
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    #[serde(flatten)]
    sampler: &'a SamplerSettings,
    prompt: &'a str,
    memory: &'a str,
    max_length: u32,
    temperature: f64,
    grammar: &'a str,
    stop_sequence: &'a [String],
    genkey: &'a str,
}

#[derive(Serialize)]
struct GenkeyBody<'a> {
    genkey: &'a str,
}

#[derive(Deserialize)]
struct ResultsBody {
    results: Vec<ResultText>,
}

#[derive(Deserialize)]
struct ResultText {
    text: String,
}

impl ResultsBody {
    fn into_text(self) -> String {
        self.results
            .into_iter()
            .next()
            .map(|r| r.text)
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct TokenCountBody {
    value: usize,
    #[serde(default)]
    ids: Vec<u32>,
}

#[derive(Deserialize)]
struct DetokenizeBody {
    result: String,
}

/// Random generation key: ten characters from `0-9A-Z`
#[must_use]
pub fn new_genkey() -> String {
    let mut rng = rand::thread_rng();
    (0..GENKEY_LEN)
        .map(|_| char::from(GENKEY_CHARSET[rng.gen_range(0..GENKEY_CHARSET.len())]))
        .collect()
}

/// KoboldCpp backend client
#[derive(Clone, Debug)]
pub struct KoboldBackend {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// Sampler settings for every request
    sampler: SamplerSettings,
    /// Key of the most recent generation
    genkey: Arc<Mutex<Option<String>>>,
    /// HTTP client
    http_client: reqwest::Client,
}

impl KoboldBackend {
    /// Create a backend with a 10 second connect timeout
    pub fn new(host: impl Into<String>, port: u16) -> anyhow::Result<Self> {
        Self::with_connect_timeout(host, port, Duration::from_secs(10))
    }

    /// Create a backend with an explicit connect timeout
    ///
    /// Streams have no overall timeout; the typing watchdog covers a server
    /// that stops sending.
    pub fn with_connect_timeout(
        host: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            host: host.into(),
            port,
            sampler: SamplerSettings::default(),
            genkey: Arc::new(Mutex::new(None)),
            http_client,
        })
    }

    /// Replace the sampler settings
    #[must_use]
    pub fn with_sampler(mut self, sampler: SamplerSettings) -> Self {
        self.sampler = sampler;
        self
    }

    /// Sampler settings in use
    #[must_use]
    pub fn sampler(&self) -> &SamplerSettings {
        &self.sampler
    }

    /// Key of the most recent generation, if any
    #[must_use]
    pub fn current_genkey(&self) -> Option<String> {
        self.genkey.lock().clone()
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url())
    }

    fn body<'a>(&'a self, request: &'a GenerationRequest, genkey: &'a str) -> GenerateBody<'a> {
        GenerateBody {
            sampler: &self.sampler,
            prompt: &request.prompt,
            memory: &request.memory,
            max_length: request.max_length,
            temperature: request.temperature,
            grammar: &request.grammar,
            stop_sequence: &request.stop_sequence,
            genkey,
        }
    }

    fn start_job(&self) -> String {
        let genkey = new_genkey();
        *self.genkey.lock() = Some(genkey.clone());
        genkey
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> anyhow::Result<reqwest::Response> {
        let mut builder = self.http_client.post(self.url(path)).json(body);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Kobold returned {status}: {body}");
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationBackend for KoboldBackend {
    fn name(&self) -> &'static str {
        "KoboldCpp"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.url("/api/v1/model"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn send_streaming(
        &self,
        request: &GenerationRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let (tx, rx) = mpsc::channel(100);
        let genkey = self.start_job();

        tracing::debug!(
            genkey = %genkey,
            prompt_len = request.prompt.len(),
            memory_len = request.memory.len(),
            max_length = request.max_length,
            "Starting streaming generation"
        );

        let response = self
            .post_json(
                "/api/extra/generate/stream",
                &self.body(request, &genkey),
                None,
            )
            .await?;
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                        return;
                    }
                };
                for token in decoder.feed(&bytes) {
                    let is_final = matches!(token, StreamingToken::Fragment { is_final: true, .. });
                    if tx.send(token).await.is_err() {
                        // Receiver dropped, stop streaming
                        return;
                    }
                    if is_final {
                        return;
                    }
                }
            }

            match decoder.finish() {
                Some(token @ StreamingToken::Fragment { is_final: true, .. }) => {
                    let _ = tx.send(token).await;
                }
                rest => {
                    if let Some(token) = rest {
                        let _ = tx.send(token).await;
                    }
                    tracing::warn!(genkey = %genkey, "Stream closed before the final fragment");
                    let _ = tx
                        .send(StreamingToken::Error(
                            "stream closed before the final fragment".to_string(),
                        ))
                        .await;
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, request: &GenerationRequest) -> anyhow::Result<GenerationResponse> {
        let start = Instant::now();
        let genkey = self.start_job();

        let response = self
            .post_json("/api/v1/generate", &self.body(request, &genkey), None)
            .await?;
        let body: ResultsBody = response.json().await?;

        Ok(GenerationResponse {
            text: body.into_text(),
            duration_ms: Some(start.elapsed().as_millis() as u64),
        })
    }

    async fn check_progress(&self) -> anyhow::Result<String> {
        let genkey = self.current_genkey().unwrap_or_default();
        let response = self
            .post_json(
                "/api/extra/generate/check",
                &GenkeyBody { genkey: &genkey },
                Some(REQUEST_TIMEOUT),
            )
            .await?;
        let body: ResultsBody = response.json().await?;
        Ok(body.into_text())
    }

    async fn abort(&self) -> anyhow::Result<()> {
        let Some(genkey) = self.current_genkey() else {
            tracing::debug!("No generation to abort on the server");
            return Ok(());
        };
        tracing::info!(genkey = %genkey, "Sending abort request");
        self.post_json(
            "/api/extra/abort",
            &GenkeyBody { genkey: &genkey },
            Some(REQUEST_TIMEOUT),
        )
        .await?;
        Ok(())
    }

    async fn token_count(&self, text: &str) -> anyhow::Result<TokenCount> {
        let response = self
            .post_json(
                "/api/extra/tokencount",
                &serde_json::json!({ "prompt": text }),
                Some(REQUEST_TIMEOUT),
            )
            .await?;
        let body: TokenCountBody = response.json().await?;
        Ok(TokenCount {
            value: body.value,
            ids: body.ids,
        })
    }

    async fn detokenize(&self, ids: &[u32]) -> anyhow::Result<String> {
        let response = self
            .post_json(
                "/api/extra/detokenize",
                &serde_json::json!({ "ids": ids }),
                Some(REQUEST_TIMEOUT),
            )
            .await?;
        let body: DetokenizeBody = response.json().await?;
        Ok(body.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve one canned HTTP response; yields the raw request body.
    async fn serve_once(status: &str, content_type: &str, body: &str) -> (u16, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut chunk = [0u8; 4096];
            let body_start = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                raw.extend_from_slice(&chunk[..n]);
                if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let headers = String::from_utf8_lossy(&raw[..body_start]).to_lowercase();
            let length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .map(|v| v.trim().parse::<usize>().unwrap())
                .unwrap_or(0);
            while raw.len() < body_start + length {
                let n = socket.read(&mut chunk).await.unwrap();
                raw.extend_from_slice(&chunk[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&raw[body_start..]).to_string()
        });

        (port, handle)
    }

    async fn collect(mut rx: mpsc::Receiver<StreamingToken>) -> Vec<StreamingToken> {
        let mut tokens = Vec::new();
        while let Some(token) = rx.recv().await {
            tokens.push(token);
        }
        tokens
    }

    #[test]
    fn test_genkey_format() {
        let key = new_genkey();
        assert_eq!(key.len(), 10);
        assert!(key
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_request_body_carries_sampler_and_prompt() {
        let backend = KoboldBackend::new(DEFAULT_HOST, DEFAULT_PORT).unwrap();
        let request = GenerationRequest::new("story")
            .with_memory("memory")
            .with_max_length(80)
            .with_temperature(0.7)
            .with_stop_sequence(vec![">".to_string()]);

        let value = serde_json::to_value(backend.body(&request, "ABCDEFGHIJ")).unwrap();
        assert_eq!(value["prompt"], "story");
        assert_eq!(value["memory"], "memory");
        assert_eq!(value["max_length"], 80);
        assert_eq!(value["temperature"], 0.7);
        assert_eq!(value["stop_sequence"], serde_json::json!([">"]));
        assert_eq!(value["genkey"], "ABCDEFGHIJ");
        assert_eq!(value["grammar"], "");
        assert_eq!(value["rep_pen"], 1.1);
        assert_eq!(value["top_p"], 0.92);
        assert_eq!(value["sampler_order"], serde_json::json!([6, 0, 1, 3, 4, 2, 5]));
        assert_eq!(value["quiet"], true);
        assert_eq!(value["use_default_badwordsids"], false);
    }

    #[tokio::test]
    async fn test_streaming_yields_fragments_until_final() {
        let events = "event: message\ndata: {\"token\": \"Hel\", \"finish_reason\": \"null\"}\n\n\
                      event: message\ndata: {\"token\": \"lo\", \"finish_reason\": \"stop\"}\n\n";
        let (port, server) = serve_once("200 OK", "text/event-stream", events).await;
        let backend = KoboldBackend::new("127.0.0.1", port).unwrap();

        let rx = backend
            .send_streaming(&GenerationRequest::new("Say hello"))
            .await
            .unwrap();
        let tokens = collect(rx).await;

        assert_eq!(
            tokens,
            vec![
                StreamingToken::Fragment {
                    text: "Hel".to_string(),
                    is_final: false
                },
                StreamingToken::Fragment {
                    text: "lo".to_string(),
                    is_final: true
                },
            ]
        );

        let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["prompt"], "Say hello");
        assert_eq!(
            body["genkey"].as_str(),
            backend.current_genkey().as_deref()
        );
    }

    #[tokio::test]
    async fn test_stream_closed_without_final_reports_error() {
        let events = "data: {\"token\": \"partial\", \"finish_reason\": null}\n\n";
        let (port, _server) = serve_once("200 OK", "text/event-stream", events).await;
        let backend = KoboldBackend::new("127.0.0.1", port).unwrap();

        let tokens = collect(
            backend
                .send_streaming(&GenerationRequest::new("x"))
                .await
                .unwrap(),
        )
        .await;

        assert_eq!(tokens.len(), 2);
        assert!(matches!(tokens[1], StreamingToken::Error(_)));
    }

    #[tokio::test]
    async fn test_http_error_fails_start() {
        let (port, _server) = serve_once("503 Service Unavailable", "text/plain", "busy").await;
        let backend = KoboldBackend::new("127.0.0.1", port).unwrap();

        let err = backend
            .send_streaming(&GenerationRequest::new("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_blocking_generate_returns_first_result() {
        let (port, _server) = serve_once(
            "200 OK",
            "application/json",
            r#"{"results": [{"text": " and then"}]}"#,
        )
        .await;
        let backend = KoboldBackend::new("127.0.0.1", port).unwrap();

        let response = backend.send(&GenerationRequest::new("x")).await.unwrap();
        assert_eq!(response.text, " and then");
    }

    #[tokio::test]
    async fn test_token_count() {
        let (port, server) = serve_once(
            "200 OK",
            "application/json",
            r#"{"value": 3, "ids": [10, 20, 30]}"#,
        )
        .await;
        let backend = KoboldBackend::new("127.0.0.1", port).unwrap();

        let count = backend.token_count("one two three").await.unwrap();
        assert_eq!(
            count,
            TokenCount {
                value: 3,
                ids: vec![10, 20, 30]
            }
        );
        let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["prompt"], "one two three");
    }

    #[tokio::test]
    async fn test_detokenize() {
        let (port, _server) =
            serve_once("200 OK", "application/json", r#"{"result": "hello"}"#).await;
        let backend = KoboldBackend::new("127.0.0.1", port).unwrap();

        assert_eq!(backend.detokenize(&[1, 2]).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_abort_without_generation_skips_request() {
        // Nothing listens on this port; the call must not try to connect
        let backend = KoboldBackend::new("127.0.0.1", 1).unwrap();
        backend.abort().await.unwrap();
    }
}

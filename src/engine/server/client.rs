//! HTTP client for the llama.cpp `llama-server` API
//!
//! Covers the endpoints the chat needs: health, streamed completion,
//! tokenize, model metadata and slot save/restore. Streamed completions use
//! server-sent events; [`SseDecoder`] turns the raw body into `data:`
//! payloads.

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::engine::base::{
    CompletionParams, CompletionResult, CompletionTimings, TokenData, TokenSink,
};
use crate::error::{LlamaChatError, Result};

/// Client for one `llama-server` instance
#[derive(Debug, Clone)]
pub struct LlamaServerClient {
    http: Client,
    base_url: String,
}

/// Request body for `POST /completion`
#[derive(Debug, Clone, Serialize)]
struct CompletionRequest<'a> {
    prompt: serde_json::Value,
    n_predict: i32,
    temperature: f32,
    top_k: i32,
    top_p: f32,
    tfs_z: f32,
    typical_p: f32,
    repeat_last_n: i32,
    repeat_penalty: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    mirostat: u8,
    mirostat_tau: f32,
    mirostat_eta: f32,
    penalize_nl: bool,
    seed: i64,
    n_probs: u32,
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    grammar: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_schema: Option<&'a serde_json::Value>,
    stream: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    ignore_eos: bool,
    cache_prompt: bool,
}

impl<'a> CompletionRequest<'a> {
    fn from_params(params: &'a CompletionParams, stream: bool) -> Self {
        Self {
            prompt: serde_json::Value::String(params.prompt.clone()),
            n_predict: params.n_predict,
            temperature: params.temperature,
            top_k: params.top_k,
            top_p: params.top_p,
            tfs_z: params.tfs_z,
            typical_p: params.typical_p,
            repeat_last_n: params.penalty_last_n,
            repeat_penalty: params.penalty_repeat,
            frequency_penalty: params.penalty_freq,
            presence_penalty: params.penalty_present,
            mirostat: params.mirostat,
            mirostat_tau: params.mirostat_tau,
            mirostat_eta: params.mirostat_eta,
            penalize_nl: params.penalize_nl,
            seed: params.seed,
            n_probs: params.n_probs,
            stop: &params.stop,
            grammar: params.grammar.as_deref(),
            json_schema: params.json_schema.as_ref(),
            stream,
            ignore_eos: false,
            cache_prompt: true,
        }
    }
}

/// One streamed completion event, or the whole non-streamed response
#[derive(Debug, Clone, Default, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    timings: Option<CompletionTimings>,
    #[serde(default)]
    error: Option<ServerError>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ServerError,
}

#[derive(Debug, Deserialize)]
struct TokenizeResponse {
    tokens: Vec<i32>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    meta: Option<ModelMeta>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelMeta {
    #[serde(default)]
    n_params: u64,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct SlotSaveResponse {
    n_saved: usize,
}

#[derive(Debug, Deserialize)]
struct SlotRestoreResponse {
    n_restored: usize,
}

/// Model metadata reported by `GET /v1/models`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelInfo {
    /// Model description (the server reports the model file name)
    pub desc: String,
    /// Parameter count
    pub n_params: u64,
    /// Size in bytes
    pub size: u64,
}

/// Throughput measured by one synthetic run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunThroughput {
    /// Prompt tokens per second
    pub prompt_per_second: f64,
    /// Generated tokens per second
    pub predicted_per_second: f64,
}

impl LlamaServerClient {
    /// Create a client for the server listening at `base_url`
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::engine::server::LlamaServerClient;
    ///
    /// let client = LlamaServerClient::new("http://127.0.0.1:8080/").unwrap();
    /// assert_eq!(client.base_url(), "http://127.0.0.1:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(LlamaChatError::Http)?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    /// Server base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Whether the server has finished loading the model
    ///
    /// Connection failures count as not ready.
    pub async fn health(&self) -> bool {
        match self.http.get(self.url("/health")).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                tracing::trace!("health check failed: {}", e);
                false
            }
        }
    }

    /// Run a streamed completion
    ///
    /// Each `content` chunk is forwarded to `on_token` in arrival order. When
    /// `cancel` fires the HTTP stream is dropped, which makes the server abort
    /// generation, and the text gathered so far is returned as interrupted.
    pub async fn completion(
        &self,
        params: &CompletionParams,
        mut on_token: TokenSink,
        cancel: CancellationToken,
    ) -> Result<CompletionResult> {
        let request = CompletionRequest::from_params(params, true);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(interrupted(String::new())),
            sent = self.http.post(self.url("/completion")).json(&request).send() => sent,
        }
        .map_err(LlamaChatError::Http)?;
        let response = check_status(response).await?;

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut text = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("completion stream cancelled after {} bytes", text.len());
                    return Ok(interrupted(text));
                }
                next = body.next() => next,
            };

            let Some(chunk) = next else {
                break;
            };
            let chunk: Bytes = chunk.map_err(LlamaChatError::Http)?;

            for data in decoder.push(&chunk) {
                let event: CompletionChunk = serde_json::from_str(&data)?;
                if let Some(error) = event.error {
                    return Err(LlamaChatError::Completion(error.message).into());
                }
                if !event.content.is_empty() {
                    text.push_str(&event.content);
                    on_token(TokenData {
                        token: event.content,
                    });
                }
                if event.stop {
                    return Ok(CompletionResult {
                        text,
                        timings: event.timings,
                        interrupted: false,
                    });
                }
            }
        }

        Err(LlamaChatError::Completion(
            "completion stream ended before the final chunk".to_string(),
        )
        .into())
    }

    /// Tokenize `content` with the loaded model's vocabulary
    pub async fn tokenize(&self, content: &str) -> Result<Vec<i32>> {
        let response = self
            .http
            .post(self.url("/tokenize"))
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await
            .map_err(LlamaChatError::Http)?;
        let parsed: TokenizeResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(LlamaChatError::Http)?;
        Ok(parsed.tokens)
    }

    /// Metadata of the loaded model
    pub async fn model_info(&self) -> Result<ModelInfo> {
        let response = self
            .http
            .get(self.url("/v1/models"))
            .send()
            .await
            .map_err(LlamaChatError::Http)?;
        let parsed: ModelsResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(LlamaChatError::Http)?;

        let entry = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| LlamaChatError::Engine("server reported no loaded model".into()))?;
        let meta = entry.meta.unwrap_or_default();
        Ok(ModelInfo {
            desc: entry.id,
            n_params: meta.n_params,
            size: meta.size,
        })
    }

    /// Run one non-streamed synthetic completion for benchmarking
    ///
    /// The prompt is `pp` copies of `token`, generation runs for exactly `tg`
    /// tokens and the prompt cache is bypassed.
    pub async fn bench_run(&self, token: i32, pp: u32, tg: u32) -> Result<RunThroughput> {
        let mut params = CompletionParams::chat_defaults(String::new());
        params.n_predict = tg as i32;
        params.stop.clear();
        let mut request = CompletionRequest::from_params(&params, false);
        request.prompt = serde_json::json!(vec![token; pp as usize]);
        request.ignore_eos = true;
        request.cache_prompt = false;

        let response = self
            .http
            .post(self.url("/completion"))
            .json(&request)
            .send()
            .await
            .map_err(LlamaChatError::Http)?;
        let chunk: CompletionChunk = check_status(response)
            .await?
            .json()
            .await
            .map_err(LlamaChatError::Http)?;
        let timings = chunk.timings.unwrap_or_default();
        Ok(RunThroughput {
            prompt_per_second: timings.prompt_per_second,
            predicted_per_second: timings.predicted_per_second,
        })
    }

    /// Save slot 0's KV cache to `filename` inside the server's slot directory
    pub async fn save_slot(&self, filename: &str) -> Result<usize> {
        let response = self
            .http
            .post(self.url("/slots/0?action=save"))
            .json(&serde_json::json!({ "filename": filename }))
            .send()
            .await
            .map_err(LlamaChatError::Http)?;
        let parsed: SlotSaveResponse = check_status(response)
            .await
            .map_err(|e| LlamaChatError::Session(e.to_string()))?
            .json()
            .await
            .map_err(LlamaChatError::Http)?;
        Ok(parsed.n_saved)
    }

    /// Restore slot 0's KV cache from `filename`
    pub async fn restore_slot(&self, filename: &str) -> Result<usize> {
        let response = self
            .http
            .post(self.url("/slots/0?action=restore"))
            .json(&serde_json::json!({ "filename": filename }))
            .send()
            .await
            .map_err(LlamaChatError::Http)?;
        let parsed: SlotRestoreResponse = check_status(response)
            .await
            .map_err(|e| LlamaChatError::Session(e.to_string()))?
            .json()
            .await
            .map_err(LlamaChatError::Http)?;
        Ok(parsed.n_restored)
    }
}

/// Result of a cancelled stream, which carries no timings
fn interrupted(text: String) -> CompletionResult {
    CompletionResult {
        text,
        timings: None,
        interrupted: true,
    }
}

/// Turn a non-success response into an engine error carrying the server's message
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|envelope| envelope.error.message)
        .unwrap_or(body);
    Err(LlamaChatError::Engine(format!("server returned {}: {}", status, message)).into())
}

/// Incremental server-sent events decoder
///
/// Bytes are buffered until a blank line closes an event, so multi-byte
/// characters split across network chunks are decoded intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed a chunk of the response body, returning every completed `data:` payload
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::engine::server::SseDecoder;
    ///
    /// let mut decoder = SseDecoder::default();
    /// assert!(decoder.push(b"data: {\"con").is_empty());
    /// assert_eq!(decoder.push(b"tent\":\"a\"}\n\n"), vec![r#"{"content":"a"}"#]);
    /// ```
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((pos, len)) = find_event_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..pos + len).collect();
            let block = String::from_utf8_lossy(&block[..pos]);
            if let Some(data) = event_data(&block) {
                events.push(data);
            }
        }
        events
    }
}

/// Position and length of the first blank line, LF or CRLF
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| (pos, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

fn event_data(block: &str) -> Option<String> {
    let data = block
        .lines()
        .filter_map(|line| line.trim_end_matches('\r').strip_prefix("data:"))
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");

    if data.is_empty() || data == "[DONE]" {
        None
    } else {
        Some(data)
    }
}

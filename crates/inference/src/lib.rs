//! HTTP client for the OpenAI-compatible chat-completions protocol spoken by
//! the inference subprocess.
//!
//! A single client against one llama-server-compatible base URL, hardened
//! to buffer SSE bytes across chunk boundaries — a naive per-chunk
//! `chunk_str.lines()` would silently drop a line split across two TCP
//! reads; this client does not.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

use orc_core::{AgentError, ChatRequest, ChatResponse, StreamChunk};

/// One event from a streaming chat-completion response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    Done,
}

#[derive(Debug, Clone)]
pub struct InferenceClient {
    base_url: String,
    client: reqwest::Client,
}

impl InferenceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_default(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn health(&self) -> bool {
        match self.client.get(self.url("/health")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// `GET /props` — used to auto-detect the context length for
    /// embedding-model selection.
    pub async fn props(&self) -> anyhow::Result<serde_json::Value> {
        let resp = self.client.get(self.url("/props")).send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!(AgentError::UpstreamStatus {
                code: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn n_ctx(&self) -> anyhow::Result<u32> {
        let props = self.props().await?;
        props
            .get("default_generation_settings")
            .and_then(|v| v.get("n_ctx"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .ok_or_else(|| anyhow::anyhow!("props response missing default_generation_settings.n_ctx"))
    }

    pub async fn list_models(&self) -> anyhow::Result<serde_json::Value> {
        let resp = self.client.get(self.url("/v1/models")).send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!(AgentError::UpstreamStatus {
                code: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn chat_completion(&self, request: &ChatRequest) -> anyhow::Result<ChatResponse> {
        let mut request = request.clone();
        request.stream = false;
        let resp = self
            .client
            .post(self.url("/v1/chat/completions"))
            .json(&request)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!(AgentError::UpstreamStatus {
                code: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Stream a chat completion as server-sent events. Lines not prefixed
    /// with `data: ` are skipped; `data: [DONE]` terminates the stream; a
    /// parse or transport error yields one `Err` item and then ends it.
    pub async fn chat_completion_stream(
        &self,
        request: &ChatRequest,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>> {
        let mut request = request.clone();
        request.stream = true;
        let resp = self
            .client
            .post(self.url("/v1/chat/completions"))
            .json(&request)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(AgentError::UpstreamStatus {
                code: status.as_u16(),
                body,
            });
        }

        let byte_stream = resp.bytes_stream();
        let state = SseState {
            byte_stream: Box::pin(byte_stream),
            buffer: String::new(),
            done: false,
        };

        Ok(Box::pin(stream::unfold(state, next_sse_event)))
    }

    pub async fn tokenize(&self, content: &str) -> anyhow::Result<usize> {
        let resp = self
            .client
            .post(self.url("/tokenize"))
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        if !status.is_success() {
            anyhow::bail!(AgentError::UpstreamStatus {
                code: status.as_u16(),
                body: body.to_string(),
            });
        }
        let tokens = body
            .get("tokens")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        Ok(tokens)
    }

    /// Forward a POST verbatim and hand back the upstream status and body
    /// unparsed — used by the orchestration server to proxy `/tokenize` and
    /// `/v1/embeddings` without re-deriving their response shape.
    pub async fn forward_post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<(u16, serde_json::Value)> {
        let resp = self.client.post(self.url(path)).json(&body).send().await?;
        let status = resp.status().as_u16();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        Ok((status, body))
    }

    /// Forward a GET verbatim — used to proxy `/v1/models`.
    pub async fn forward_get(&self, path: &str) -> anyhow::Result<(u16, serde_json::Value)> {
        let resp = self.client.get(self.url(path)).send().await?;
        let status = resp.status().as_u16();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        Ok((status, body))
    }

    /// Request an embedding and L2-normalize it in place before returning,
    /// so callers can use a plain dot product for cosine similarity.
    pub async fn embed(&self, text: &str, model: &str) -> anyhow::Result<Vec<f32>> {
        let resp = self
            .client
            .post(self.url("/v1/embeddings"))
            .json(&serde_json::json!({ "input": text, "model": model }))
            .send()
            .await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        if !status.is_success() {
            anyhow::bail!(AgentError::UpstreamStatus {
                code: status.as_u16(),
                body: body.to_string(),
            });
        }
        let raw: Vec<f32> = body
            .get("data")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("embedding"))
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect())
            .ok_or_else(|| anyhow::anyhow!("embeddings response missing data[0].embedding"))?;
        Ok(normalize(raw))
    }
}

pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let magnitude: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for x in v.iter_mut() {
            *x /= magnitude;
        }
    }
    v
}

struct SseState {
    byte_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: String,
    done: bool,
}

async fn next_sse_event(
    mut state: SseState,
) -> Option<(anyhow::Result<StreamEvent>, SseState)> {
    loop {
        if state.done {
            return None;
        }

        if let Some(idx) = state.buffer.find('\n') {
            let line = state.buffer[..idx].trim_end_matches('\r').to_string();
            state.buffer.drain(..=idx);
            if line.is_empty() {
                continue;
            }
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                state.done = true;
                return Some((Ok(StreamEvent::Done), state));
            }
            return match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => Some((Ok(StreamEvent::Chunk(chunk)), state)),
                Err(err) => {
                    state.done = true;
                    Some((Err(err.into()), state))
                }
            };
        }

        match state.byte_stream.next().await {
            Some(Ok(bytes)) => {
                state.buffer.push_str(&String::from_utf8_lossy(&bytes));
            }
            Some(Err(err)) => {
                state.done = true;
                return Some((Err(err.into()), state));
            }
            None => {
                state.done = true;
                return None;
            }
        }
    }
}

//! LM Studio backend over its REST API.
//!
//! Model listing uses `/api/v0/models`; completions use the
//! OpenAI-compatible `/v1/chat/completions` endpoint with `stream: true`.

use crate::conversation::Turn;
use crate::error::{Result, SessionError};
use crate::inference::{FragmentStream, InferenceClient, InferenceConnector, InferenceModel};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connector that builds [`LmStudioClient`]s sharing one HTTP pool.
#[derive(Clone)]
pub struct LmStudioConnector {
    http: reqwest::Client,
}

impl LmStudioConnector {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| SessionError::connection("<client>", e))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl InferenceConnector for LmStudioConnector {
    async fn connect(&self, api_url: &str) -> Result<Arc<dyn InferenceClient>> {
        let client = LmStudioClient {
            http: self.http.clone(),
            base_url: base_url(api_url),
        };
        // Probe so an unreachable server fails here and not mid-generation
        client.fetch_models().await?;
        debug!(base_url = %client.base_url, "Connected to LM Studio");
        Ok(Arc::new(client))
    }
}

fn base_url(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl ModelEntry {
    fn is_generative(&self) -> bool {
        matches!(self.kind.as_deref(), None | Some("llm") | Some("vlm"))
    }

    fn is_loaded(&self) -> bool {
        self.state.as_deref() == Some("loaded")
    }
}

/// Client bound to one LM Studio server.
#[derive(Clone)]
pub struct LmStudioClient {
    http: reqwest::Client,
    base_url: String,
}

impl LmStudioClient {
    async fn fetch_models(&self) -> Result<Vec<ModelEntry>> {
        let url = format!("{}/api/v0/models", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SessionError::connection(&self.base_url, e))?
            .error_for_status()
            .map_err(|e| SessionError::connection(&self.base_url, e))?;
        let list: ModelList = response
            .json()
            .await
            .map_err(|e| SessionError::connection(&self.base_url, e))?;
        Ok(list.data)
    }
}

#[async_trait]
impl InferenceClient for LmStudioClient {
    async fn list_downloaded_models(&self) -> Result<Vec<String>> {
        Ok(self
            .fetch_models()
            .await?
            .into_iter()
            .filter(ModelEntry::is_generative)
            .map(|m| m.id)
            .collect())
    }

    async fn list_loaded_models(&self) -> Result<Vec<String>> {
        Ok(self
            .fetch_models()
            .await?
            .into_iter()
            .filter(|m| m.is_generative() && m.is_loaded())
            .map(|m| m.id)
            .collect())
    }

    async fn model(&self, model_key: &str) -> Result<Box<dyn InferenceModel>> {
        let known = self.list_downloaded_models().await?;
        if !known.iter().any(|m| m == model_key) {
            return Err(SessionError::ModelNotFound(model_key.to_string()));
        }
        Ok(Box::new(LmStudioModel {
            client: self.clone(),
            key: model_key.to_string(),
        }))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One model on an LM Studio server.
pub struct LmStudioModel {
    client: LmStudioClient,
    key: String,
}

#[async_trait]
impl InferenceModel for LmStudioModel {
    fn key(&self) -> &str {
        &self.key
    }

    async fn respond_stream(&self, prompt: Vec<Turn>) -> Result<FragmentStream> {
        let url = format!("{}/v1/chat/completions", self.client.base_url);
        let request = ChatRequest {
            model: &self.key,
            messages: prompt
                .iter()
                .map(|t| ChatMessage {
                    role: t.role.as_str(),
                    content: &t.text,
                })
                .collect(),
            stream: true,
        };
        info!(model = %self.key, turns = prompt.len(), "Opening completion stream");

        let response = self
            .client
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SessionError::connection(&self.client.base_url, e))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SessionError::ModelNotFound(self.key.clone()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::Stream(format!("{}: {}", status, body)));
        }

        let mut bytes = Box::pin(response.bytes_stream());
        let stream = async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| SessionError::Stream(e.to_string()))?;
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let parsed = parse_sse_line(&String::from_utf8_lossy(&line))?;
                    match parsed {
                        SseLine::Fragment(text) => yield text,
                        SseLine::Done => break 'outer,
                        SseLine::Skip => {}
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Fragment(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let chunk: ChatChunk =
        serde_json::from_str(payload).map_err(|e| SessionError::Stream(e.to_string()))?;
    if let Some(error) = chunk.error {
        return Err(SessionError::Stream(error.to_string()));
    }
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    if text.is_empty() {
        Ok(SseLine::Skip)
    } else {
        Ok(SseLine::Fragment(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_defaults_to_http() {
        assert_eq!(base_url("localhost:1234"), "http://localhost:1234");
        assert_eq!(base_url("https://lm.local:1234/"), "https://lm.local:1234");
    }

    #[test]
    fn parses_fragment_lines() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"content":"He"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), SseLine::Fragment("He".into()));
    }

    #[test]
    fn role_only_delta_is_skipped() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
    }

    #[test]
    fn done_marker_terminates() {
        assert_eq!(parse_sse_line("data: [DONE]\n").unwrap(), SseLine::Done);
    }

    #[test]
    fn error_payload_fails_the_stream() {
        let line = r#"data: {"error":{"message":"model crashed"}}"#;
        assert!(matches!(parse_sse_line(line), Err(SessionError::Stream(_))));
        assert!(matches!(
            parse_sse_line("data: {not json"),
            Err(SessionError::Stream(_))
        ));
    }

    #[test]
    fn model_listing_filters_embeddings() {
        let json = r#"{"object":"list","data":[
            {"id":"qwen","type":"llm","state":"loaded"},
            {"id":"nomic-embed","type":"embeddings","state":"loaded"},
            {"id":"llava","type":"vlm","state":"not-loaded"}
        ]}"#;
        let list: ModelList = serde_json::from_str(json).unwrap();
        let downloaded: Vec<&str> = list
            .data
            .iter()
            .filter(|m| m.is_generative())
            .map(|m| m.id.as_str())
            .collect();
        let loaded: Vec<&str> = list
            .data
            .iter()
            .filter(|m| m.is_generative() && m.is_loaded())
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(downloaded, vec!["qwen", "llava"]);
        assert_eq!(loaded, vec!["qwen"]);
    }
}

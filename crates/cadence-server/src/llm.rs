//! OpenAI-compatible chat completion and embedding adapters.
//!
//! Works with any server exposing `/v1/chat/completions` with streaming and
//! `/v1/embeddings` (OpenAI, vLLM, llama.cpp server, Ollama).

use crate::config::{EmbeddingConfig, LlmConfig};
use crate::sse::{SseEvent, SseParser};
use async_trait::async_trait;
use cadence_agent::{
    ChatMessage, ChatRole, CompletionOptions, EmbeddingPort, LlmError, LlmPort, StreamDelta,
    ToolCall, ToolDefinition,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

const STREAM_BUFFER: usize = 64;

pub struct OpenAiChat {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        // A streamed answer may run far longer than any single read, so the
        // limit applies per read rather than to the whole response.
        let read_limit = Duration::from_secs(config.request_timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(read_limit)
            .read_timeout(read_limit)
            .build()
            .map_err(|e| LlmError::Fatal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: format!("{}/v1/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &CompletionOptions,
    ) -> Value {
        let mut body = json!({
            "model": self.model,
            "stream": true,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    let role = match message.role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    };
    let mut wire = json!({ "role": role, "content": message.content });
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }
                })
            })
            .collect();
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

fn transport_error(e: reqwest::Error) -> LlmError {
    if e.is_builder() {
        LlmError::Fatal(e.to_string())
    } else {
        LlmError::Transient(e.to_string())
    }
}

#[async_trait]
impl LlmPort for OpenAiChat {
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &CompletionOptions,
    ) -> Result<mpsc::Receiver<StreamDelta>, LlmError> {
        let body = self.request_body(messages, tools, options);
        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            "starting streaming chat completion"
        );

        let mut request = self.client.post(&self.url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "chat completion rejected");
            return Err(LlmError::from_status(status.as_u16(), error_body));
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut parser = SseParser::new();
            let mut pending = Vec::new();
            let mut state = ChunkState::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!("completion stream read failed: {}", e);
                        let _ = tx.send(StreamDelta::Error(transport_error(e))).await;
                        return;
                    }
                };
                pending.extend_from_slice(&chunk);
                let text = take_utf8(&mut pending);

                for event in parser.feed(&text) {
                    let deltas = match event {
                        SseEvent::Data(data) => state.apply(&data),
                        SseEvent::Done => state.finish(),
                    };
                    for delta in deltas {
                        let done = delta == StreamDelta::Done;
                        // A dropped receiver means the turn was cancelled.
                        if tx.send(delta).await.is_err() || done {
                            return;
                        }
                    }
                }
            }

            for delta in state.finish() {
                if tx.send(delta).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

/// Drains the longest valid UTF-8 prefix, keeping a split trailing
/// character for the next chunk.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let rest = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Turns completion chunks into deltas. Tool call fragments are collected
/// by index and released, complete, when the stream ends.
#[derive(Debug, Default)]
struct ChunkState {
    calls: BTreeMap<usize, PartialCall>,
    finished: bool,
}

impl ChunkState {
    fn apply(&mut self, data: &str) -> Vec<StreamDelta> {
        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable completion chunk");
                return Vec::new();
            }
        };

        let mut deltas = Vec::new();
        for delta in chunk.choices.into_iter().filter_map(|c| c.delta) {
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                deltas.push(StreamDelta::Token(content));
            }
            for fragment in delta.tool_calls.unwrap_or_default() {
                let call = self.calls.entry(fragment.index).or_default();
                if let Some(id) = fragment.id {
                    call.id = id;
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name {
                        call.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        call.arguments.push_str(&arguments);
                    }
                }
            }
        }
        deltas
    }

    fn finish(&mut self) -> Vec<StreamDelta> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut deltas = Vec::new();
        for (index, call) in std::mem::take(&mut self.calls) {
            if call.name.is_empty() {
                continue;
            }
            let arguments = if call.arguments.trim().is_empty() {
                Value::Object(Map::new())
            } else {
                serde_json::from_str(&call.arguments).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, tool = %call.name, "tool call arguments are not JSON");
                    Value::Object(Map::new())
                })
            };
            let id = if call.id.is_empty() {
                format!("call_{}", index)
            } else {
                call.id
            };
            deltas.push(StreamDelta::ToolCall(ToolCall {
                id,
                name: call.name,
                arguments,
            }));
        }
        deltas.push(StreamDelta::Done);
        deltas
    }
}

pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbeddings {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Fatal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: format!("{}/v1/embeddings", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingPort for OpenAiEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&json!({ "model": self.model, "input": text }));
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), error_body));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Fatal(format!("invalid embedding response: {}", e)))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| LlmError::Fatal("embedding response had no data".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_chunks_become_tokens() {
        let mut state = ChunkState::default();
        let deltas = state.apply(r#"{"choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#);
        assert_eq!(deltas, vec![StreamDelta::Token("Hel".to_string())]);
        assert!(state.apply(r#"{"choices":[{"delta":{"content":""}}]}"#).is_empty());
        assert!(state.apply("not json").is_empty());
        assert_eq!(state.finish(), vec![StreamDelta::Done]);
        assert!(state.finish().is_empty());
    }

    #[test]
    fn tool_call_fragments_are_assembled() {
        let mut state = ChunkState::default();
        state.apply(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc","type":"function","function":{"name":"calculator","arguments":"{\"expr"}}]}}]}"#);
        state.apply(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ession\":\"6*7\"}"}}]}}]}"#);
        state.apply(r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_def","function":{"name":"memory_query","arguments":"oops"}}]}}]}"#);

        assert_eq!(
            state.finish(),
            vec![
                StreamDelta::ToolCall(ToolCall {
                    id: "call_abc".to_string(),
                    name: "calculator".to_string(),
                    arguments: json!({"expression": "6*7"}),
                }),
                StreamDelta::ToolCall(ToolCall {
                    id: "call_def".to_string(),
                    name: "memory_query".to_string(),
                    arguments: json!({}),
                }),
                StreamDelta::Done,
            ]
        );
    }

    #[test]
    fn split_utf8_is_carried_over() {
        let word = "café".as_bytes();
        let mut pending = word[..4].to_vec();
        assert_eq!(take_utf8(&mut pending), "caf");
        assert_eq!(pending.len(), 1);
        pending.extend_from_slice(&word[4..]);
        assert_eq!(take_utf8(&mut pending), "é");
        assert!(pending.is_empty());
    }

    #[test]
    fn assistant_tool_calls_are_serialized() {
        let message = ChatMessage {
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: "calculator".to_string(),
                arguments: json!({"expression": "1+1"}),
            }],
            ..ChatMessage::assistant("")
        };
        let wire = wire_message(&message);
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], "{\"expression\":\"1+1\"}");

        let result = wire_message(&ChatMessage::tool_result("call_1", "2"));
        assert_eq!(result["role"], "tool");
        assert_eq!(result["tool_call_id"], "call_1");
    }

    #[test]
    fn request_body_carries_options_and_tools() {
        let chat = OpenAiChat::new(&LlmConfig {
            base_url: "http://localhost:8080/".to_string(),
            ..LlmConfig::default()
        })
        .unwrap();
        assert_eq!(chat.url, "http://localhost:8080/v1/chat/completions");

        let tools = vec![ToolDefinition {
            name: "calculator".to_string(),
            description: "Evaluates arithmetic".to_string(),
            parameters: json!({"type": "object"}),
        }];
        let body = chat.request_body(
            &[ChatMessage::user("hi")],
            &tools,
            &CompletionOptions {
                temperature: Some(0.5),
                max_tokens: Some(256),
            },
        );
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "calculator");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["max_tokens"], 256);

        let plain = chat.request_body(&[], &[], &CompletionOptions::default());
        assert!(plain.get("tools").is_none());
        assert!(plain.get("temperature").is_none());
    }
}

use std::{pin::Pin, time::Duration};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use serde::Serialize;
use serde_json::{Value, json};
use shared::{
    config::server::GenerationConfig,
    models::{ContentPart, Message, MessageRole},
};
use thiserror::Error;
use tracing::{debug, instrument};

/// One step of a streamed generation.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Text to append to the reply.
    Token(String),
    /// The model started a tool call.
    ToolStart {
        /// Tool name.
        name: String,
        /// Tool arguments.
        input: Value,
    },
    /// A tool call finished.
    ToolEnd {
        /// Tool name.
        name: String,
        /// What the tool returned, as text.
        output: String,
    },
}

/// One finished tool call, kept as the retrieval context of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolContext {
    /// Tool name.
    pub tool_name: String,
    /// Arguments, as a JSON string.
    pub tool_input: String,
    /// What the tool returned.
    pub tool_output: String,
}

/// Generation failures.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// The generator is misconfigured.
    #[error("generator configuration error: {0}")]
    Config(String),
    /// The upstream request could not be sent or read.
    #[error("generation request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The upstream answered with an error status.
    #[error("generation endpoint returned {status}: {body}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },
    /// The upstream stream could not be understood.
    #[error("malformed generation stream: {0}")]
    Protocol(String),
}

/// Stream of generation events.
pub type GenerationStream =
    Pin<Box<dyn Stream<Item = Result<GenerationEvent, GeneratorError>> + Send + 'static>>;

/// Everything a generator needs to answer one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Conversation being answered.
    pub conversation_id: String,
    /// Model to use.
    pub model: String,
    /// Ordered transcript, system message first.
    pub history: Vec<Message>,
    /// Tools the active personality may call.
    pub tools: Vec<String>,
}

/// Produces a streamed reply for a conversation.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Starts generating. Errors before the first event are returned directly;
    /// later ones arrive through the stream.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, GeneratorError>;
}

/// Renders a tool invocation the way it appears inside the reply text.
#[must_use]
pub fn render_tool_start(name: &str, input: &Value) -> String {
    let args = match input {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| match value {
                Value::String(text) => format!("{key}={text}"),
                other => format!("{key}={other}"),
            })
            .collect::<Vec<_>>()
            .join("; "),
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    format!("**Tool invocation**: {name} <- ```{args}```\n\n")
}

/// Client for OpenAI-compatible `/chat/completions` streaming endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl OpenAiGenerator {
    /// Builds a client from configuration.
    ///
    /// # Errors
    /// Returns [`GeneratorError::Config`] when the endpoint is empty or the
    /// HTTP client cannot be built.
    pub fn new(config: &GenerationConfig) -> Result<Self, GeneratorError> {
        let endpoint = config.endpoint.trim();
        if endpoint.is_empty() {
            return Err(GeneratorError::Config("generation.endpoint is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds.max(1)))
            .build()
            .map_err(|err| GeneratorError::Config(err.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", endpoint.trim_end_matches('/')),
            api_key: config.api_key.clone(),
        })
    }

    fn body(request: &GenerationRequest) -> Value {
        let messages: Vec<Value> = request
            .history
            .iter()
            .filter(|message| message.role != MessageRole::Tool)
            .map(wire_message)
            .collect();
        json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
        })
    }
}

fn wire_message(message: &Message) -> Value {
    let text_only = message
        .content
        .iter()
        .all(|part| matches!(part, ContentPart::Text { .. }));
    let content = if text_only {
        Value::String(message.text())
    } else {
        serde_json::to_value(&message.content).unwrap_or_else(|_| Value::String(message.text()))
    };
    json!({ "role": message.role.as_str(), "content": content })
}

enum SseLine {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, GeneratorError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }

    let chunk: Value = serde_json::from_str(data)
        .map_err(|err| GeneratorError::Protocol(format!("{err}: {data}")))?;
    if let Some(error) = chunk.get("error") {
        return Err(GeneratorError::Protocol(error.to_string()));
    }
    Ok(chunk
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map_or(SseLine::Skip, |text| SseLine::Token(text.to_string())))
}

#[async_trait]
impl Generator for OpenAiGenerator {
    #[instrument(
        name = "generator.openai",
        skip(self, request),
        fields(chat_id = %request.conversation_id, model = %request.model),
        err
    )]
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, GeneratorError> {
        let mut builder = self.client.post(&self.url).json(&Self::body(&request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GeneratorError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        debug!("generation stream opened");

        let mut bytes = Box::pin(response.bytes_stream());
        let events = try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut finished = false;
            while !finished {
                let Some(chunk) = bytes.next().await else {
                    break;
                };
                buffer.extend_from_slice(&chunk.map_err(GeneratorError::from)?);

                while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(line.trim_end())? {
                        SseLine::Token(text) => yield GenerationEvent::Token(text),
                        SseLine::Done => {
                            finished = true;
                            break;
                        }
                        SseLine::Skip => {}
                    }
                }
            }
        };

        Ok(Box::pin(events))
    }
}

/// Offline generator that answers with the last user message.
///
/// Selected when no generation endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, GeneratorError> {
        let prompt = request
            .history
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .map(Message::text)
            .unwrap_or_default();

        let reply = format!("You said: {prompt}");
        let tokens: Vec<Result<GenerationEvent, GeneratorError>> = reply
            .split_inclusive(' ')
            .map(|word| Ok(GenerationEvent::Token(word.to_string())))
            .collect();
        Ok(Box::pin(stream::iter(tokens)))
    }
}

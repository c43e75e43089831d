//! Chat-completions protocol: OpenAI, and the vendors that expose the same
//! endpoint shape (Mistral, Perplexity, Together, Cohere's compatibility API).

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use log::{debug, trace, error};

use crate::Provider;
use crate::error::{Error, Result};
use crate::normalize::ReplyStream;
use crate::request::{ResponseSchema, ToolSpec};
use super::{BackendRequest, BackendSettings, ChatBackend};

// ===== Message Types =====

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage<'a>
{   pub role: &'static str
  , pub content: &'a str
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a>
{   pub model: &'a str
  , pub messages: Vec<ChatMessage<'a>>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<&'a [ToolSpec]>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse
{   pub choices: Vec<Choice>
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice
{   pub message: Value
  , pub finish_reason: Option<String>
}

/// `response_format` constraining output to `schema`. `strict` is only
/// sent when the caller chose it.
pub fn json_schema_format(schema: &ResponseSchema) -> Value
{   let mut json_schema = json!({
      "name": schema.name,
      "schema": schema.schema
    });
    if let Some(strict) = schema.strict
    {   json_schema["strict"] = json!(strict);
    }
    json!({
      "type": "json_schema",
      "json_schema": json_schema
    })
}

pub fn chat_request<'a>(
  request: &BackendRequest<'a>
, stream: bool
) -> ChatRequest<'a>
{   ChatRequest
    {   model: request.model
      , messages: request.messages
          .iter()
          .map(|m| ChatMessage
          {   role: m.role.as_str()
            , content: &m.content
          })
          .collect()
      , tools: request.tools
      , response_format: request.schema.map(json_schema_format)
      , stream: stream.then_some(true)
    }
}

/// Message of the first choice. A tool-call-only message has null content,
/// so its tool calls become the content.
fn reply_from(response: ChatResponse, provider: Provider) -> Result<Value>
{   let choice = response.choices
      .into_iter()
      .next()
      .ok_or_else(|| {
        error!("No choices in {} response", provider);
        Error::EmptyResponse(provider.to_string())
      })?;
    trace!("{} finish reason: {:?}", provider, choice.finish_reason);

    let message = choice.message;
    let content_missing = message
      .get("content")
      .map_or(true, Value::is_null);
    if !content_missing
    {   return Ok(message);
    }
    match message.get("tool_calls")
    {   Some(calls) => Ok(json!({ "content": calls }))
      , None => Err(Error::EmptyResponse(provider.to_string()))
    }
}

/// Text of one streamed chunk: the content delta, else the argument
/// fragments of any tool-call deltas. An `error` event fails the stream.
fn delta_from(provider: Provider, chunk: &Value) -> Result<Option<Value>>
{   if let Some(e) = super::stream_error(provider, chunk)
    {   return Err(e);
    }
    let Some(delta) = chunk.pointer("/choices/0/delta")
    else { return Ok(None) };

    if let Some(text) = delta.get("content").and_then(Value::as_str)
    {   if !text.is_empty()
        {   return Ok(Some(json!({ "content": text })));
        }
    }

    let arguments: String = delta.get("tool_calls")
      .and_then(Value::as_array)
      .map(|calls| calls
        .iter()
        .filter_map(|c| c.pointer("/function/arguments").and_then(Value::as_str))
        .collect())
      .unwrap_or_default();
    Ok((!arguments.is_empty()).then(|| json!({ "content": arguments })))
}

// ===== Client =====

#[derive(Debug, Clone)]
pub struct OpenAiCompatible
{   settings: BackendSettings
}

impl OpenAiCompatible
{   pub fn new(settings: BackendSettings) -> Self
    {   debug!(
          "Creating chat-completions client for {} at {}",
          settings.provider,
          settings.base_url
        );
        OpenAiCompatible
        {   settings
        }
    }

    pub fn boxed(settings: BackendSettings) -> Box<dyn ChatBackend>
    {   Box::new(OpenAiCompatible::new(settings))
    }

    fn endpoint(&self) -> String
    {   format!(
          "{}/chat/completions",
          self.settings.base_url.trim_end_matches('/')
        )
    }

    async fn post(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response>
    {   trace!("{} request: {:?}", self.settings.provider, body);
        let response = self.settings.http
          .post(self.endpoint())
          .bearer_auth(&self.settings.api_key)
          .json(body)
          .send()
          .await
          .map_err(|e| {
            error!("HTTP error: {}", e);
            Error::from(e)
          })?;
        super::check_status(self.settings.provider, response).await
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatible
{   fn provider(&self) -> Provider
    {   self.settings.provider
    }

    fn supports_structured_output(&self) -> bool
    {   self.settings.structured_output
    }

    async fn complete(&self, request: &BackendRequest<'_>) -> Result<Value>
    {   debug!("Completing with {}/{}", self.settings.provider, request.model);
        let body = chat_request(request, false);
        let response = self.post(&body).await?;

        let chat_response: ChatResponse = response.json().await
          .map_err(|e| {
            error!("Parse error: {}", e);
            Error::Parse(e.to_string())
          })?;

        reply_from(chat_response, self.settings.provider)
    }

    async fn stream(&self, request: &BackendRequest<'_>) -> Result<ReplyStream>
    {   debug!("Streaming from {}/{}", self.settings.provider, request.model);
        let body = chat_request(request, true);
        let response = self.post(&body).await?;

        let provider = self.settings.provider;
        let chunks = super::sse_json(response)
          .filter_map(move |chunk| async move {
            match chunk.and_then(|value| delta_from(provider, &value))
            {   Ok(delta) => delta.map(Ok)
              , Err(e) => Some(Err(e))
            }
          });
        Ok(Box::pin(chunks))
    }
}

//! Anthropic messages API.
//!
//! System turns are lifted into the top-level `system` field. Structured
//! output is done with a single forced tool whose input schema is the
//! caller's schema; the tool input becomes the reply content.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use log::{debug, trace, error};

use crate::{Provider, Role};
use crate::error::{Error, Result};
use crate::normalize::ReplyStream;
use super::{BackendRequest, BackendSettings, ChatBackend};

pub const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Serialize)]
pub struct AnthropicMessage<'a>
{   pub role: &'static str
  , pub content: &'a str
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest<'a>
{   pub model: &'a str
  , pub max_tokens: u32
  , pub messages: Vec<AnthropicMessage<'a>>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>
  , #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse
{   pub content: Vec<Value>
  , #[serde(default)]
    pub stop_reason: Option<String>
}

pub fn messages_request<'a>(
  request: &BackendRequest<'a>
, max_tokens: u32
, stream: bool
) -> MessagesRequest<'a>
{   let system: Vec<&str> = request.messages
      .iter()
      .filter(|m| m.role == Role::System)
      .map(|m| m.content.as_str())
      .collect();

    let messages = request.messages
      .iter()
      .filter_map(|m| match m.role
      {   Role::User => Some(AnthropicMessage
          {   role: "user"
            , content: &m.content
          })
        , Role::Assistant => Some(AnthropicMessage
          {   role: "assistant"
            , content: &m.content
          })
        , Role::System => None
      })
      .collect();

    let mut tools: Vec<Value> = request.tools
      .unwrap_or_default()
      .iter()
      .map(|t| {
        let mut tool = json!({
          "name": t.function.name,
          "input_schema": t.function.parameters
        });
        if let Some(description) = &t.function.description
        {   tool["description"] = json!(description);
        }
        tool
      })
      .collect();

    let mut tool_choice = None;
    if let Some(schema) = request.schema
    {   tools.push(json!({
          "name": schema.name,
          "description": "Respond using this schema.",
          "input_schema": schema.schema
        }));
        tool_choice = Some(json!({ "type": "tool", "name": schema.name }));
    }

    MessagesRequest
    {   model: request.model
      , max_tokens
      , messages
      , system: (!system.is_empty()).then(|| system.join("\n\n"))
      , tools
      , tool_choice
      , stream: stream.then_some(true)
    }
}

/// Reply content: the forced tool's input under a schema, else the joined
/// text blocks, else any tool-use blocks.
fn reply_from(
  response: MessagesResponse
, schema_tool: Option<&str>
) -> Result<Value>
{   trace!("anthropic stop reason: {:?}", response.stop_reason);
    let is_tool_use = |block: &&Value| block.get("type")
      .and_then(Value::as_str) == Some("tool_use");

    if let Some(name) = schema_tool
    {   let input = response.content
          .iter()
          .filter(is_tool_use)
          .find(|b| b.get("name").and_then(Value::as_str) == Some(name))
          .and_then(|b| b.get("input"));
        if let Some(input) = input
        {   return Ok(json!({ "content": input }));
        }
    }

    let text: String = response.content
      .iter()
      .filter_map(|b| b.get("text").and_then(Value::as_str))
      .collect();
    if !text.is_empty()
    {   return Ok(json!({ "content": text }));
    }

    let tool_uses: Vec<&Value> = response.content
      .iter()
      .filter(is_tool_use)
      .collect();
    if tool_uses.is_empty()
    {   error!("No content in anthropic response");
        return Err(Error::EmptyResponse(Provider::Anthropic.to_string()));
    }
    Ok(json!({ "content": tool_uses }))
}

/// Text or partial tool input of one streamed event
fn delta_from(event: &Value) -> Result<Option<Value>>
{   match event.get("type").and_then(Value::as_str)
    {   Some("content_block_delta") => {
          let delta = event.get("delta");
          let text = delta
            .and_then(|d| d.get("text").or_else(|| d.get("partial_json")))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
          Ok(text.map(|s| json!({ "content": s })))
        }
      , Some("error") => {
          let message = event
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("stream error");
          error!("anthropic stream error: {}", message);
          Err(Error::Api
          {   provider: Provider::Anthropic.to_string()
            , message: message.to_string()
          })
        }
      , _ => Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct AnthropicClient
{   settings: BackendSettings
}

impl AnthropicClient
{   pub fn new(settings: BackendSettings) -> Self
    {   debug!("Creating AnthropicClient at {}", settings.base_url);
        AnthropicClient
        {   settings
        }
    }

    pub fn boxed(settings: BackendSettings) -> Box<dyn ChatBackend>
    {   Box::new(AnthropicClient::new(settings))
    }

    async fn post(&self, body: &MessagesRequest<'_>) -> Result<reqwest::Response>
    {   trace!("anthropic request: {:?}", body);
        let response = self.settings.http
          .post(format!(
            "{}/messages",
            self.settings.base_url.trim_end_matches('/')
          ))
          .header("x-api-key", &self.settings.api_key)
          .header("anthropic-version", API_VERSION)
          .json(body)
          .send()
          .await
          .map_err(|e| {
            error!("HTTP error: {}", e);
            Error::from(e)
          })?;
        super::check_status(Provider::Anthropic, response).await
    }
}

#[async_trait]
impl ChatBackend for AnthropicClient
{   fn provider(&self) -> Provider
    {   Provider::Anthropic
    }

    fn supports_structured_output(&self) -> bool
    {   self.settings.structured_output
    }

    async fn complete(&self, request: &BackendRequest<'_>) -> Result<Value>
    {   debug!("Completing with anthropic/{}", request.model);
        let body = messages_request(request, self.settings.max_tokens, false);
        let response = self.post(&body).await?;

        let parsed: MessagesResponse = response.json().await
          .map_err(|e| {
            error!("Parse error: {}", e);
            Error::Parse(e.to_string())
          })?;

        reply_from(parsed, request.schema.map(|s| s.name.as_str()))
    }

    async fn stream(&self, request: &BackendRequest<'_>) -> Result<ReplyStream>
    {   debug!("Streaming from anthropic/{}", request.model);
        let body = messages_request(request, self.settings.max_tokens, true);
        let response = self.post(&body).await?;

        let chunks = super::sse_json(response)
          .filter_map(|event| async move {
            match event.and_then(|e| delta_from(&e))
            {   Ok(delta) => delta.map(Ok)
              , Err(e) => Some(Err(e))
            }
          });
        Ok(Box::pin(chunks))
    }
}

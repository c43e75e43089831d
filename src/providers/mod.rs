//! Chat back ends the dispatcher can call directly.
//!
//! Each module speaks one vendor wire protocol. `openai` also covers the
//! vendors that expose an OpenAI-compatible chat-completions endpoint.

pub mod openai;
pub mod anthropic;
pub mod google;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use log::{error, trace};
use serde_json::Value;

use crate::{Message, Provider};
use crate::error::{Error, Result};
use crate::normalize::ReplyStream;
use crate::request::{ResponseSchema, ToolSpec};

pub use openai::OpenAiCompatible;
pub use anthropic::AnthropicClient;
pub use google::GoogleClient;

/// Everything an adapter needs to reach its vendor
#[derive(Debug, Clone)]
pub struct BackendSettings
{   pub provider: Provider
  , pub base_url: String
  , pub api_key: String
  , pub http: reqwest::Client
  , pub max_tokens: u32
  , /// Whether this vendor can constrain decoding to a JSON schema
    pub structured_output: bool
}

/// One chat call, already in caller order with any candidate directive
/// prepended
#[derive(Debug, Clone)]
pub struct BackendRequest<'a>
{   pub model: &'a str
  , pub messages: &'a [Message]
  , pub tools: Option<&'a [ToolSpec]>
  , /// Only set when the back end reports schema support
    pub schema: Option<&'a ResponseSchema>
}

/// Uniform calling convention over vendor chat APIs.
///
/// Replies are returned as JSON values for `normalize::normalize`: an
/// object whose `content` holds text or structured output.
#[async_trait]
pub trait ChatBackend: Send + Sync
{   fn provider(&self) -> Provider;

    /// Can decoding be constrained to a caller schema
    fn supports_structured_output(&self) -> bool;

    async fn complete(&self, request: &BackendRequest<'_>) -> Result<Value>;

    async fn stream(&self, request: &BackendRequest<'_>) -> Result<ReplyStream>;
}

/// Fail with the body text when the vendor returns a non-success status
pub(crate) async fn check_status(
  provider: Provider
, response: reqwest::Response
) -> Result<reqwest::Response>
{   let status = response.status();
    trace!("{} response status: {}", provider, status);
    if status.is_success()
    {   return Ok(response);
    }
    let error_text = response.text().await
      .unwrap_or_else(|_| "Unknown error".to_string());
    error!("{} API error ({}): {}", provider, status, error_text);
    Err(Error::Api
    {   provider: provider.to_string()
      , message: format!("HTTP {}: {}", status.as_u16(), error_text)
    })
}

/// Error carried in-band by a streamed event (`{"error": {...}}`)
pub(crate) fn stream_error(provider: Provider, event: &Value) -> Option<Error>
{   let error = event.get("error")?;
    let message = error
      .get("message")
      .and_then(Value::as_str)
      .map(str::to_string)
      .unwrap_or_else(|| error.to_string());
    error!("{} stream error: {}", provider, message);
    Some(Error::Api
    {   provider: provider.to_string()
      , message
    })
}

/// Server-sent events of a streaming response, parsed as JSON.
/// Blank keep-alives are skipped and `[DONE]` ends the stream.
pub(crate) fn sse_json(response: reqwest::Response) -> ReplyStream
{   let mut events = Box::pin(response.bytes_stream().eventsource());
    Box::pin(async_stream::stream! {
      while let Some(event) = events.next().await
      { match event
        {   Ok(event) => {
              let data = event.data.trim();
              if data.is_empty()
              {   continue;
              }
              if data == "[DONE]"
              {   break;
              }
              trace!("SSE event {}: {}", event.event, data);
              match serde_json::from_str::<Value>(data)
              {   Ok(value) => {
                    yield Ok(value);
                  }
                , Err(e) => {
                    error!("Bad SSE payload: {}", e);
                    yield Err(Error::Parse(e.to_string()));
                    break;
                  }
              }
            }
          , Err(e) => {
              error!("SSE stream error: {}", e);
              yield Err(Error::Http(format!("stream error: {}", e)));
              break;
            }
        }
      }
    })
}

//! Google Gemini generateContent API.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use log::{debug, trace, error};

use crate::{Provider, Role};
use crate::error::{Error, Result};
use crate::normalize::ReplyStream;
use super::{BackendRequest, BackendSettings, ChatBackend};

#[derive(Debug, Clone, Serialize)]
pub struct Content<'a>
{   pub role: &'static str
  , pub parts: Vec<Part<'a>>
}

#[derive(Debug, Clone, Serialize)]
pub struct Part<'a>
{   pub text: &'a str
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest<'a>
{   pub contents: Vec<Content<'a>>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Value>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<Value>
}

pub fn generate_request<'a>(request: &BackendRequest<'a>) -> GenerateRequest<'a>
{   let system: Vec<Value> = request.messages
      .iter()
      .filter(|m| m.role == Role::System)
      .map(|m| json!({ "text": m.content }))
      .collect();

    let contents = request.messages
      .iter()
      .filter_map(|m| {
        let role = match m.role
        {   Role::User => "user"
          , Role::Assistant => "model"
          , Role::System => return None
        };
        Some(Content
        {   role
          , parts: vec![Part { text: &m.content }]
        })
      })
      .collect();

    let tools = request.tools
      .filter(|t| !t.is_empty())
      .map(|tools| {
        let declarations: Vec<Value> = tools
          .iter()
          .map(|t| {
            let mut declaration = json!({
              "name": t.function.name,
              "parameters": t.function.parameters
            });
            if let Some(description) = &t.function.description
            {   declaration["description"] = json!(description);
            }
            declaration
          })
          .collect();
        json!([{ "functionDeclarations": declarations }])
      });

    GenerateRequest
    {   contents
      , system_instruction: (!system.is_empty())
          .then(|| json!({ "parts": system }))
      , tools
      , generation_config: request.schema.map(|s| json!({
          "responseMimeType": "application/json",
          "responseSchema": s.schema
        }))
    }
}

/// Parts of the first candidate: joined text, else function calls
fn content_of(response: &Value) -> Option<Value>
{   let parts = response
      .pointer("/candidates/0/content/parts")?
      .as_array()?;
    let text: String = parts
      .iter()
      .filter_map(|p| p.get("text").and_then(Value::as_str))
      .collect();
    if !text.is_empty()
    {   return Some(json!({ "content": text }));
    }
    let calls: Vec<&Value> = parts
      .iter()
      .filter_map(|p| p.get("functionCall"))
      .collect();
    (!calls.is_empty()).then(|| json!({ "content": calls }))
}

#[derive(Debug, Clone)]
pub struct GoogleClient
{   settings: BackendSettings
}

impl GoogleClient
{   pub fn new(settings: BackendSettings) -> Self
    {   debug!("Creating GoogleClient at {}", settings.base_url);
        GoogleClient
        {   settings
        }
    }

    pub fn boxed(settings: BackendSettings) -> Box<dyn ChatBackend>
    {   Box::new(GoogleClient::new(settings))
    }

    async fn post(
      &self
    , url: String
    , body: &GenerateRequest<'_>
    ) -> Result<reqwest::Response>
    {   trace!("google request: {:?}", body);
        let response = self.settings.http
          .post(url)
          .header("x-goog-api-key", &self.settings.api_key)
          .json(body)
          .send()
          .await
          .map_err(|e| {
            error!("HTTP error: {}", e);
            Error::from(e)
          })?;
        super::check_status(Provider::Google, response).await
    }

    fn model_url(&self, model: &str, method: &str) -> String
    {   format!(
          "{}/models/{}:{}",
          self.settings.base_url.trim_end_matches('/'),
          model,
          method
        )
    }
}

#[async_trait]
impl ChatBackend for GoogleClient
{   fn provider(&self) -> Provider
    {   Provider::Google
    }

    fn supports_structured_output(&self) -> bool
    {   self.settings.structured_output
    }

    async fn complete(&self, request: &BackendRequest<'_>) -> Result<Value>
    {   debug!("Completing with google/{}", request.model);
        let body = generate_request(request);
        let url = self.model_url(request.model, "generateContent");
        let response = self.post(url, &body).await?;

        let parsed: Value = response.json().await
          .map_err(|e| {
            error!("Parse error: {}", e);
            Error::Parse(e.to_string())
          })?;

        content_of(&parsed).ok_or_else(|| {
          error!("No candidates in google response");
          Error::EmptyResponse(Provider::Google.to_string())
        })
    }

    async fn stream(&self, request: &BackendRequest<'_>) -> Result<ReplyStream>
    {   debug!("Streaming from google/{}", request.model);
        let body = generate_request(request);
        let url = format!(
          "{}?alt=sse",
          self.model_url(request.model, "streamGenerateContent")
        );
        let response = self.post(url, &body).await?;

        let chunks = super::sse_json(response)
          .filter_map(|event| async move {
            match event
            {   Ok(value) => match super::stream_error(Provider::Google, &value)
                {   Some(e) => Some(Err(e))
                  , None => content_of(&value).map(Ok)
                }
              , Err(e) => Some(Err(e))
            }
          });
        Ok(Box::pin(chunks))
    }
}

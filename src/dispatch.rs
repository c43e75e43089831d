//! Resolve a selected provider to a chat back end and call it.
//!
//! Providers map to adapters through `ADAPTERS`; supporting another vendor
//! means adding one entry there. All lookups and credential checks happen
//! before any network traffic.

use std::collections::HashMap;
use std::sync::Arc;
use log::{debug, error, warn};

use crate::{Message, Provider};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::normalize::{self, TextStream};
use crate::providers::{
  AnthropicClient, BackendRequest, BackendSettings, ChatBackend, GoogleClient
, OpenAiCompatible
};
use crate::request::{ProviderDescriptor, ResponseSchema, ToolSpec};

/// Constructor for a back end
pub type BackendBuilder = fn(BackendSettings) -> Box<dyn ChatBackend>;

/// How to reach one provider
#[derive(Debug, Clone, Copy)]
pub struct AdapterEntry
{   pub provider: Provider
  , /// Environment variable holding the default credential
    pub env_key: &'static str
  , pub base_url: &'static str
  , pub structured_output: bool
  , pub build: BackendBuilder
}

pub static ADAPTERS: &[AdapterEntry] = &[
  AdapterEntry
  {   provider: Provider::OpenAI
    , env_key: "OPENAI_API_KEY"
    , base_url: "https://api.openai.com/v1"
    , structured_output: true
    , build: OpenAiCompatible::boxed
  }
, AdapterEntry
  {   provider: Provider::Anthropic
    , env_key: "ANTHROPIC_API_KEY"
    , base_url: "https://api.anthropic.com/v1"
    , structured_output: true
    , build: AnthropicClient::boxed
  }
, AdapterEntry
  {   provider: Provider::Google
    , env_key: "GOOGLE_API_KEY"
    , base_url: "https://generativelanguage.googleapis.com/v1beta"
    , structured_output: true
    , build: GoogleClient::boxed
  }
, AdapterEntry
  {   provider: Provider::Mistral
    , env_key: "MISTRAL_API_KEY"
    , base_url: "https://api.mistral.ai/v1"
    , structured_output: true
    , build: OpenAiCompatible::boxed
  }
, AdapterEntry
  {   provider: Provider::Perplexity
    , env_key: "PPLX_API_KEY"
    , base_url: "https://api.perplexity.ai"
    , structured_output: false
    , build: OpenAiCompatible::boxed
  }
, AdapterEntry
  {   provider: Provider::Together
    , env_key: "TOGETHER_API_KEY"
    , base_url: "https://api.together.xyz/v1"
    , structured_output: false
    , build: OpenAiCompatible::boxed
  }
, AdapterEntry
  {   provider: Provider::Cohere
    , env_key: "COHERE_API_KEY"
    , base_url: "https://api.cohere.ai/compatibility/v1"
    , structured_output: false
    , build: OpenAiCompatible::boxed
  }
];

pub fn adapter_entry(provider: Provider) -> Option<&'static AdapterEntry>
{   ADAPTERS.iter().find(|entry| entry.provider == provider)
}

/// Inputs of one direct back-end call
#[derive(Debug, Clone, Default)]
pub struct InvokeRequest
{   pub messages: Vec<Message>
  , /// Candidate list the selection came from; a matching entry's
    /// `system_prompt` is prepended to the conversation
    pub candidates: Vec<ProviderDescriptor>
  , pub tools: Option<Vec<ToolSpec>>
  , pub response_schema: Option<ResponseSchema>
  , /// Per-call credentials, checked before the configured defaults
    pub credentials: HashMap<Provider, String>
}

impl InvokeRequest
{   pub fn new(messages: Vec<Message>) -> Self
    {   InvokeRequest
        {   messages
          , ..InvokeRequest::default()
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<ProviderDescriptor>) -> Self
    {   self.candidates = candidates;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self
    {   self.tools = Some(tools);
        self
    }

    pub fn with_response_schema(mut self, schema: ResponseSchema) -> Self
    {   self.response_schema = Some(schema);
        self
    }

    pub fn with_credential(
      mut self
    , provider: Provider
    , key: impl Into<String>
    ) -> Self
    {   self.credentials.insert(provider, key.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher
{   config: Arc<ClientConfig>
  , http: reqwest::Client
}

impl Dispatcher
{   pub fn new(config: Arc<ClientConfig>, http: reqwest::Client) -> Self
    {   Dispatcher
        {   config
          , http
        }
    }

    /// Per-call credential, else the configured default
    pub fn credential(
      &self
    , provider: Provider
    , per_call: &HashMap<Provider, String>
    ) -> Result<String>
    {   if let Some(key) = per_call.get(&provider)
        {   debug!("Using per-call credential for {}", provider);
            return Ok(key.clone());
        }
        if let Some(key) = self.config.provider_keys.get(&provider)
        {   debug!("Using configured credential for {}", provider);
            return Ok(key.clone());
        }
        error!("No credential for {}", provider);
        Err(Error::MissingCredential(provider.to_string()))
    }

    /// Back end for a selected provider
    pub fn resolve(
      &self
    , selected: &ProviderDescriptor
    , per_call: &HashMap<Provider, String>
    ) -> Result<Box<dyn ChatBackend>>
    {   let provider: Provider = selected.provider.parse().map_err(|e| {
          error!("Unsupported provider: {}", selected.provider);
          e
        })?;
        let entry = adapter_entry(provider)
          .ok_or_else(|| Error::UnsupportedProvider(provider.to_string()))?;
        let api_key = self.credential(provider, per_call)?;
        let base_url = self.config.provider_base_urls
          .get(&provider)
          .cloned()
          .unwrap_or_else(|| entry.base_url.to_string());

        Ok((entry.build)(BackendSettings
        {   provider
          , base_url
          , api_key
          , http: self.http.clone()
          , max_tokens: self.config.max_tokens
          , structured_output: entry.structured_output
        }))
    }

    pub async fn invoke(
      &self
    , selected: &ProviderDescriptor
    , request: &InvokeRequest
    ) -> Result<String>
    {   let backend = self.resolve(selected, &request.credentials)?;
        self.invoke_with(backend.as_ref(), selected, request).await
    }

    pub async fn invoke_stream(
      &self
    , selected: &ProviderDescriptor
    , request: &InvokeRequest
    ) -> Result<TextStream>
    {   let backend = self.resolve(selected, &request.credentials)?;
        self.invoke_stream_with(backend.as_ref(), selected, request).await
    }

    /// Call an already-built back end
    pub async fn invoke_with(
      &self
    , backend: &dyn ChatBackend
    , selected: &ProviderDescriptor
    , request: &InvokeRequest
    ) -> Result<String>
    {   let messages = conversation_for(selected, request);
        let backend_request = BackendRequest
        {   model: &selected.model
          , messages: &messages
          , tools: request.tools.as_deref()
          , schema: schema_for(backend, request.response_schema.as_ref())
        };
        debug!("Invoking {} with {} messages", selected, messages.len());

        let reply = tokio::time::timeout(
            self.config.invoke_timeout(),
            backend.complete(&backend_request)
          )
          .await
          .map_err(|_| {
            error!("{} timed out", selected);
            Error::Timeout
          })??;
        Ok(normalize::normalize(&reply))
    }

    /// Stream from an already-built back end
    pub async fn invoke_stream_with(
      &self
    , backend: &dyn ChatBackend
    , selected: &ProviderDescriptor
    , request: &InvokeRequest
    ) -> Result<TextStream>
    {   let messages = conversation_for(selected, request);
        let backend_request = BackendRequest
        {   model: &selected.model
          , messages: &messages
          , tools: request.tools.as_deref()
          , schema: schema_for(backend, request.response_schema.as_ref())
        };
        debug!("Streaming {} with {} messages", selected, messages.len());

        let replies = tokio::time::timeout(
            self.config.invoke_timeout(),
            backend.stream(&backend_request)
          )
          .await
          .map_err(|_| {
            error!("{} stream start timed out", selected);
            Error::Timeout
          })??;
        Ok(normalize::with_idle_timeout(
          normalize::normalize_stream(replies),
          self.config.stream_idle_timeout()
        ))
    }
}

/// Schema to pass down, dropped for back ends that cannot honor it
fn schema_for<'a>(
  backend: &dyn ChatBackend
, schema: Option<&'a ResponseSchema>
) -> Option<&'a ResponseSchema>
{   let schema = schema?;
    if backend.supports_structured_output()
    {   Some(schema)
    } else
    {   warn!(
          "{} cannot constrain output to schema {}; sending unconstrained",
          backend.provider(),
          schema.name
        );
        None
    }
}

/// Conversation with the selected candidate's system prompt in front
pub fn conversation_for(
  selected: &ProviderDescriptor
, request: &InvokeRequest
) -> Vec<Message>
{   let directive = selected.system_prompt.as_ref().or_else(|| {
      request.candidates
        .iter()
        .find(|c| c.same_model(selected))
        .and_then(|c| c.system_prompt.as_ref())
    });

    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(prompt) = directive
    {   debug!("Prepending system prompt for {}", selected);
        messages.push(Message::system(prompt.clone()));
    }
    messages.extend(request.messages.iter().cloned());
    messages
}

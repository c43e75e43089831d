//! Provider → model registry.
//!
//! Validation here is advisory: it catches typos before a request leaves
//! the process, but the routing service has the final say and may accept
//! models released after this table was written.

use log::{debug, error};

use crate::Provider;
use crate::error::Error;
use crate::request::ProviderDescriptor;

const OPENAI_MODELS: &[&str] = &[
  "gpt-3.5-turbo"
, "gpt-3.5-turbo-0125"
, "gpt-4"
, "gpt-4-0613"
, "gpt-4-1106-preview"
, "gpt-4-turbo"
, "gpt-4-turbo-preview"
, "gpt-4-turbo-2024-04-09"
, "gpt-4o-2024-05-13"
, "gpt-4o-2024-08-06"
, "gpt-4o"
, "gpt-4o-mini-2024-07-18"
, "gpt-4o-mini"
, "gpt-4-0125-preview"
, "o1-preview"
, "o1-preview-2024-09-12"
, "o1-mini"
, "o1-mini-2024-09-12"
];

const ANTHROPIC_MODELS: &[&str] = &[
  "claude-2.1"
, "claude-3-opus-20240229"
, "claude-3-sonnet-20240229"
, "claude-3-5-sonnet-20240620"
, "claude-3-haiku-20240307"
];

const GOOGLE_MODELS: &[&str] = &[
  "gemini-pro"
, "gemini-1.0-pro-latest"
, "gemini-1.5-pro-latest"
, "gemini-1.5-pro-exp-0801"
, "gemini-1.5-flash-latest"
];

const MISTRAL_MODELS: &[&str] = &[
  "mistral-large-latest"
, "mistral-large-2407"
, "mistral-large-2402"
, "mistral-medium-latest"
, "mistral-small-latest"
, "codestral-latest"
, "open-mistral-7b"
, "open-mixtral-8x7b"
, "open-mixtral-8x22b"
];

const PERPLEXITY_MODELS: &[&str] = &[
  "llama-3.1-sonar-large-128k-online"
];

const TOGETHER_MODELS: &[&str] = &[
  "Mistral-7B-Instruct-v0.2"
, "Mixtral-8x7B-Instruct-v0.1"
, "Mixtral-8x22B-Instruct-v0.1"
, "Llama-3-70b-chat-hf"
, "Llama-3-8b-chat-hf"
, "Qwen2-72B-Instruct"
, "Meta-Llama-3.1-8B-Instruct-Turbo"
, "Meta-Llama-3.1-70B-Instruct-Turbo"
, "Meta-Llama-3.1-405B-Instruct-Turbo"
];

const COHERE_MODELS: &[&str] = &[
  "command-r"
, "command-r-plus"
];

impl Provider
{   /// Models registered for this provider
    pub fn models(&self) -> &'static [&'static str]
    {   match self
        {   Provider::OpenAI => OPENAI_MODELS
          , Provider::Anthropic => ANTHROPIC_MODELS
          , Provider::Google => GOOGLE_MODELS
          , Provider::Mistral => MISTRAL_MODELS
          , Provider::Perplexity => PERPLEXITY_MODELS
          , Provider::Together => TOGETHER_MODELS
          , Provider::Cohere => COHERE_MODELS
        }
    }

    pub fn supports_model(&self, model: &str) -> bool
    {   self.models().contains(&model)
    }
}

/// Registered models for a provider identifier
pub fn resolve_models(provider: &str)
  -> Result<&'static [&'static str], Error>
{   provider
      .parse::<Provider>()
      .map(|p| p.models())
      .map_err(|_| Error::InvalidProvider(provider.to_string()))
}

/// Check a descriptor against the registry.
///
/// Custom descriptors name a caller-defined model, so only the provider is
/// checked, but they must carry pricing and latency for the router to rank
/// them.
pub fn validate(descriptor: &ProviderDescriptor) -> Result<Provider, Error>
{   let provider = descriptor.provider
      .parse::<Provider>()
      .map_err(|_| {
        error!("Unknown provider: {}", descriptor.provider);
        Error::InvalidProvider(descriptor.provider.clone())
      })?;

    if descriptor.is_custom == Some(true)
    {   let complete = descriptor.context_length.is_some()
          && descriptor.input_price.is_some()
          && descriptor.output_price.is_some()
          && descriptor.latency.is_some();
        if !complete
        {   error!("Incomplete custom provider: {}", descriptor);
            return Err(Error::InvalidCustomProvider(descriptor.to_string()));
        }
        debug!("Accepted custom provider: {}", descriptor);
        return Ok(provider);
    }

    if !provider.supports_model(&descriptor.model)
    {   error!("Model not registered: {}", descriptor);
        return Err(Error::InvalidModelForProvider
        {   provider: descriptor.provider.clone()
          , model: descriptor.model.clone()
        });
    }

    Ok(provider)
}

//! Client configuration: routing-service credentials, timeouts and
//! per-provider keys for direct dispatch.
//!
//! Built once and shared read-only by the client and its dispatcher.

use std::collections::HashMap;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use log::debug;

use crate::Provider;
use crate::request::ProviderDescriptor;

pub const DEFAULT_BASE_URL: &str = "https://api.notdiamond.ai";
pub const API_KEY_ENV: &str = "NOTDIAMOND_API_KEY";
pub const API_URL_ENV: &str = "NOTDIAMOND_API_URL";

/// What `create` does when the router returns an empty ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyRankingPolicy
{   /// Surface the empty ranking as an error
    Fail
  , /// Dispatch to this provider instead
    UseProvider(ProviderDescriptor)
}

impl Default for EmptyRankingPolicy
{   fn default() -> Self
    {   EmptyRankingPolicy::Fail
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig
{   /// Routing-service API key, sent as a bearer token
    pub api_key: String
  , /// Routing-service base URL
    pub base_url: String
  , /// Client identifier sent as `User-Agent`
    pub user_agent: String
  , /// Deadline for feedback, latency and preference calls
    pub request_timeout_secs: u64
  , /// Added to the ranking `timeout` to get the local deadline
    pub ranking_grace_secs: u64
  , /// Deadline for a complete back-end call, and for a stream to start
    pub invoke_timeout_secs: u64
  , /// Longest wait between two stream chunks
    pub stream_idle_timeout_secs: u64
  , /// `max_tokens` for back ends that require one (Anthropic)
    pub max_tokens: u32
  , /// Default credentials for direct dispatch
    pub provider_keys: HashMap<Provider, String>
  , /// Back-end base URL overrides
    pub provider_base_urls: HashMap<Provider, String>
  , /// Behaviour of `create` on an empty ranking
    pub empty_ranking: EmptyRankingPolicy
}

impl Default for ClientConfig
{   fn default() -> Self
    {   ClientConfig
        {   api_key: String::new()
          , base_url: DEFAULT_BASE_URL.to_string()
          , user_agent: format!(
              "notdiamond-rs/{}",
              env!("CARGO_PKG_VERSION")
            )
          , request_timeout_secs: 30
          , ranking_grace_secs: 5
          , invoke_timeout_secs: 120
          , stream_idle_timeout_secs: 60
          , max_tokens: 4096
          , provider_keys: HashMap::new()
          , provider_base_urls: HashMap::new()
          , empty_ranking: EmptyRankingPolicy::default()
        }
    }
}

impl ClientConfig
{   pub fn new(api_key: impl Into<String>) -> Self
    {   ClientConfig
        {   api_key: api_key.into()
          , ..ClientConfig::default()
        }
    }

    /// Defaults overlaid with `NOTDIAMOND_API_KEY`, `NOTDIAMOND_API_URL`
    /// and every provider key variable that is set.
    pub fn from_env() -> Self
    {   let mut config = ClientConfig::default();
        if let Ok(key) = std::env::var(API_KEY_ENV)
        {   config.api_key = key;
        }
        if let Ok(url) = std::env::var(API_URL_ENV)
        {   debug!("Using routing base URL from {}", API_URL_ENV);
            config.base_url = url;
        }
        for provider in Provider::ALL
        {   let Some(entry) = crate::dispatch::adapter_entry(provider)
            else { continue };
            if let Ok(key) = std::env::var(entry.env_key)
            {   debug!("Loaded {} key from {}", provider, entry.env_key);
                config.provider_keys.insert(provider, key);
            }
        }
        config
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self
    {   self.api_key = key.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self
    {   self.base_url = url.into();
        self
    }

    pub fn with_provider_key(
      mut self
    , provider: Provider
    , key: impl Into<String>
    ) -> Self
    {   self.provider_keys.insert(provider, key.into());
        self
    }

    pub fn with_provider_base_url(
      mut self
    , provider: Provider
    , url: impl Into<String>
    ) -> Self
    {   self.provider_base_urls.insert(provider, url.into());
        self
    }

    pub fn with_invoke_timeout(mut self, secs: u64) -> Self
    {   self.invoke_timeout_secs = secs;
        self
    }

    pub fn with_empty_ranking(mut self, policy: EmptyRankingPolicy) -> Self
    {   self.empty_ranking = policy;
        self
    }

    pub fn request_timeout(&self) -> Duration
    {   Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ranking_grace(&self) -> Duration
    {   Duration::from_secs(self.ranking_grace_secs)
    }

    pub fn invoke_timeout(&self) -> Duration
    {   Duration::from_secs(self.invoke_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration
    {   Duration::from_secs(self.stream_idle_timeout_secs)
    }

    /// Routing-service URL for an endpoint path
    pub fn endpoint(&self, path: &str) -> String
    {   format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

//! Async client for the Not Diamond model router.
//!
//! The router ranks a set of candidate chat models for a conversation; this
//! crate builds those ranking requests, reports feedback and latency for a
//! routing session, and can call the selected provider's chat API directly.
//!
//! ```no_run
//! use notdiamond::{Message, NotDiamond, ClientConfig};
//! use notdiamond::request::{ApiResponse, ProviderDescriptor, SelectOptions};
//!
//! # async fn run() -> notdiamond::error::Result<()> {
//! let client = NotDiamond::new(ClientConfig::from_env())?;
//! let messages = vec![Message::user("What is 12x12?")];
//! let candidates = vec![
//!   ProviderDescriptor::new("openai", "gpt-4o")
//! , ProviderDescriptor::new("anthropic", "claude-3-5-sonnet-20240620")
//! ];
//! match client.model_select(&messages, &candidates, &SelectOptions::default()).await?
//! {   ApiResponse::Success(selection) => println!("{:?}", selection.providers[0])
//!   , ApiResponse::Error(e) => eprintln!("{}", e.detail)
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod config;
pub mod registry;
pub mod request;
pub mod transport;
pub mod normalize;
pub mod providers;
pub mod dispatch;
pub mod client;

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

pub use client::NotDiamond;
pub use config::ClientConfig;
pub use dispatch::Dispatcher;
pub use error::Error;

/// Chat vendors the dispatcher can call directly.
/// Serialized as the lowercase identifier the routing service uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider
{   /// OpenAI (GPT-4, GPT-4o, o1)
    OpenAI
  , /// Anthropic (Claude models)
    Anthropic
  , /// Google (Gemini)
    Google
  , /// Mistral AI
    Mistral
  , /// Perplexity AI (online Llama models)
    Perplexity
  , /// Together AI (hosts Llama, Mixtral, Qwen)
    Together
  , /// Cohere (Command R)
    Cohere
}

impl Provider
{   pub const ALL: [Provider; 7] = [
      Provider::OpenAI
    , Provider::Anthropic
    , Provider::Google
    , Provider::Mistral
    , Provider::Perplexity
    , Provider::Together
    , Provider::Cohere
    ];

    /// Wire identifier
    pub fn as_str(&self) -> &'static str
    {   match self
        {   Provider::OpenAI => "openai"
          , Provider::Anthropic => "anthropic"
          , Provider::Google => "google"
          , Provider::Mistral => "mistral"
          , Provider::Perplexity => "perplexity"
          , Provider::Together => "together"
          , Provider::Cohere => "cohere"
        }
    }
}

impl fmt::Display for Provider
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   f.write_str(self.as_str())
    }
}

impl FromStr for Provider
{   type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {   Provider::ALL
          .iter()
          .find(|p| p.as_str() == s)
          .copied()
          .ok_or_else(|| Error::UnsupportedProvider(s.to_string()))
    }
}

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role
{   User
  , Assistant
  , System
}

impl Role
{   pub fn as_str(&self) -> &'static str
    {   match self
        {   Role::User => "user"
          , Role::Assistant => "assistant"
          , Role::System => "system"
        }
    }
}

/// One turn of a conversation. Order within a conversation is significant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Message
{   pub role: Role
  , pub content: String
}

impl Message
{   pub fn new(role: Role, content: impl Into<String>) -> Self
    {   Message
        {   role
          , content: content.into()
        }
    }

    pub fn user(content: impl Into<String>) -> Self
    {   Message::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self
    {   Message::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self
    {   Message::new(Role::System, content)
    }
}

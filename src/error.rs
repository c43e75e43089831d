//! Error types for local and back-end failures.
//!
//! Failures reported by the routing service itself are not errors in this
//! sense: they come back as `request::ApiResponse::Error` so callers can
//! branch on them without unwinding. Everything here is either a caller
//! mistake caught before the network, a misconfiguration, or a failure
//! while talking to a chat back end directly.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error
{   /// Malformed caller input (empty candidate list, bad default index)
    #[error("validation error: {0}")]
    Validation(String)
  , /// Provider identifier not in the registry
    #[error("invalid provider: {0}")]
    InvalidProvider(String)
  , /// Model not registered for the given provider
    #[error("model {model} is not registered for provider {provider}")]
    InvalidModelForProvider
    {   provider: String
      , model: String
    }
  , /// Custom descriptor without the pricing/latency fields
    #[error("custom provider {0} must set context_length, input_price, output_price and latency")]
    InvalidCustomProvider(String)
  , /// No back-end adapter for this provider identifier
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String)
  , /// No per-call or configured credential for the provider
    #[error("missing credential for provider: {0}")]
    MissingCredential(String)
  , /// The routing service answered with a `detail` payload
    #[error("routing service error: {0}")]
    Remote(String)
  , /// Transport failure while calling a back end
    #[error("HTTP error: {0}")]
    Http(String)
  , /// Back end returned a non-success status
    #[error("API error ({provider}): {message}")]
    Api
    {   provider: String
      , message: String
    }
  , /// Failed to parse a back-end response
    #[error("parse error: {0}")]
    Parse(String)
  , /// Back end answered without any usable content
    #[error("{0} returned no content")]
    EmptyResponse(String)
  , /// Local deadline expired
    #[error("request timed out")]
    Timeout
  , /// Invalid client configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String)
}

impl From<reqwest::Error> for Error
{   fn from(e: reqwest::Error) -> Self
    {   if e.is_timeout()
        {   Error::Timeout
        } else
        {   Error::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error
{   fn from(e: serde_json::Error) -> Self
    {   Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error
{   fn from(_: tokio::time::error::Elapsed) -> Self
    {   Error::Timeout
    }
}

//! Wire types for the routing service.
//!
//! Caller-facing options use Rust names; the request structs rename every
//! field to the service's snake_case key and drop unset options entirely,
//! since an absent key tells the service to use its own default.

use std::fmt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Message;
use crate::error::Error;

/// Ranking deadline sent when the caller sets none, in seconds
pub const DEFAULT_SELECT_TIMEOUT_SECS: f64 = 5.0;

// ===== Providers =====

/// A candidate (or selected) model.
///
/// `provider` and `model` stay strings so rankings naming models newer than
/// the local registry still deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor
{   pub provider: String
  , pub model: String
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u64>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_price: Option<f64>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_price: Option<f64>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_custom: Option<bool>
  , /// Prepended as a system message when this candidate is dispatched.
    /// Local only, never sent to the router.
    #[serde(skip)]
    pub system_prompt: Option<String>
}

impl ProviderDescriptor
{   pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self
    {   ProviderDescriptor
        {   provider: provider.into()
          , model: model.into()
          , context_length: None
          , input_price: None
          , output_price: None
          , latency: None
          , is_custom: None
          , system_prompt: None
        }
    }

    /// A caller-defined model with the pricing the router needs to rank it
    pub fn custom(
      provider: impl Into<String>
    , model: impl Into<String>
    , context_length: u64
    , input_price: f64
    , output_price: f64
    , latency: f64
    ) -> Self
    {   ProviderDescriptor
        {   context_length: Some(context_length)
          , input_price: Some(input_price)
          , output_price: Some(output_price)
          , latency: Some(latency)
          , is_custom: Some(true)
          , ..ProviderDescriptor::new(provider, model)
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self
    {   self.system_prompt = Some(prompt.into());
        self
    }

    /// Same provider and model, ignoring pricing and prompts
    pub fn same_model(&self, other: &ProviderDescriptor) -> bool
    {   self.provider == other.provider && self.model == other.model
    }
}

impl fmt::Display for ProviderDescriptor
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   write!(f, "{}/{}", self.provider, self.model)
    }
}

// ===== Tools & schemas =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec
{   pub name: String
  , #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>
  , pub parameters: Value
}

/// Function-calling declaration, forwarded verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec
{   #[serde(rename = "type")]
    pub kind: String
  , pub function: FunctionSpec
}

impl ToolSpec
{   pub fn function(
      name: impl Into<String>
    , description: Option<String>
    , parameters: Value
    ) -> Self
    {   ToolSpec
        {   kind: "function".to_string()
          , function: FunctionSpec
            {   name: name.into()
              , description
              , parameters
            }
        }
    }
}

/// JSON schema the final answer must follow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSchema
{   pub name: String
  , pub schema: Value
  , /// OpenAI strict mode. Requires `additionalProperties: false` and every
    /// property listed in `required`; left to the vendor default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>
}

impl ResponseSchema
{   pub fn new(name: impl Into<String>, schema: Value) -> Self
    {   ResponseSchema
        {   name: name.into()
          , schema
          , strict: None
        }
    }

    pub fn with_strict(mut self, strict: bool) -> Self
    {   self.strict = Some(strict);
        self
    }
}

// ===== Model select =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tradeoff
{   Cost
  , Latency
}

/// Fallback the router uses when ranking times out or fails server side
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum DefaultProvider
{   ByDescriptor(ProviderDescriptor)
  , /// 0-based index into the candidate list
    ByIndex(usize)
  , #[default]
    None
}

impl DefaultProvider
{   pub fn is_none(&self) -> bool
    {   matches!(self, DefaultProvider::None)
    }
}

/// Optional knobs for `model_select`
#[derive(Debug, Clone, Default)]
pub struct SelectOptions
{   pub tradeoff: Option<Tradeoff>
  , pub max_model_depth: Option<u32>
  , pub tools: Option<Vec<ToolSpec>>
  , /// Ask the router to hash rather than store message content
    pub hash_content: Option<bool>
  , pub preference_id: Option<String>
  , /// Seconds the router may spend ranking before falling back
    pub timeout: Option<f64>
  , pub default: DefaultProvider
  , pub previous_session: Option<String>
  , pub response_model: Option<ResponseSchema>
}

impl SelectOptions
{   pub fn with_tradeoff(mut self, tradeoff: Tradeoff) -> Self
    {   self.tradeoff = Some(tradeoff);
        self
    }

    pub fn with_max_model_depth(mut self, depth: u32) -> Self
    {   self.max_model_depth = Some(depth);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self
    {   self.tools = Some(tools);
        self
    }

    pub fn with_hash_content(mut self, hash: bool) -> Self
    {   self.hash_content = Some(hash);
        self
    }

    pub fn with_preference_id(mut self, id: impl Into<String>) -> Self
    {   self.preference_id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, secs: f64) -> Self
    {   self.timeout = Some(secs);
        self
    }

    pub fn with_default(mut self, default: DefaultProvider) -> Self
    {   self.default = default;
        self
    }

    pub fn with_previous_session(mut self, session: impl Into<String>) -> Self
    {   self.previous_session = Some(session.into());
        self
    }

    pub fn with_response_model(mut self, schema: ResponseSchema) -> Self
    {   self.response_model = Some(schema);
        self
    }

    /// Ranking deadline in seconds, defaulted
    pub fn timeout_secs(&self) -> f64
    {   self.timeout.unwrap_or(DEFAULT_SELECT_TIMEOUT_SECS)
    }
}

/// Body of the model-select call
#[derive(Debug, Serialize)]
pub struct ModelSelectRequest<'a>
{   pub messages: &'a [Message]
  , pub llm_providers: &'a [ProviderDescriptor]
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub tradeoff: Option<Tradeoff>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub max_model_depth: Option<u32>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<&'a [ToolSpec]>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_content: Option<bool>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub preference_id: Option<&'a str>
  , pub timeout: f64
  , #[serde(skip_serializing_if = "DefaultProvider::is_none")]
    pub default: &'a DefaultProvider
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_session: Option<&'a str>
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub response_model: Option<&'a Value>
}

impl<'a> ModelSelectRequest<'a>
{   pub fn new(
      messages: &'a [Message]
    , candidates: &'a [ProviderDescriptor]
    , options: &'a SelectOptions
    ) -> Self
    {   ModelSelectRequest
        {   messages
          , llm_providers: candidates
          , tradeoff: options.tradeoff
          , max_model_depth: options.max_model_depth
          , tools: options.tools.as_deref()
          , hash_content: options.hash_content
          , preference_id: options.preference_id.as_deref()
          , timeout: options.timeout_secs()
          , default: &options.default
          , previous_session: options.previous_session.as_deref()
          , response_model: options.response_model
              .as_ref()
              .map(|r| &r.schema)
        }
    }
}

/// Ranked providers for one routing session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult
{   pub providers: Vec<ProviderDescriptor>
  , pub session_id: String
}

impl SelectionResult
{   /// The router's top recommendation
    pub fn top(&self) -> Option<&ProviderDescriptor>
    {   self.providers.first()
    }
}

// ===== Metrics =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyFeedback
{   pub accuracy: f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyFeedback
{   pub tokens_per_second: f64
}

/// Body shared by the feedback and latency calls
#[derive(Debug, Serialize)]
pub struct MetricRequest<'a, F>
{   pub session_id: &'a str
  , pub feedback: F
  , pub provider: &'a ProviderDescriptor
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedbackResponse
{   pub session_id: String
  , pub feedback: AccuracyFeedback
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LatencyResponse
{   pub session_id: String
  , pub tokens_per_second: f64
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PreferenceResponse
{   pub preference_id: String
}

// ===== Responses =====

/// Failure payload from the routing service, also used for transport
/// failures so callers handle both the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse
{   pub detail: String
}

impl ErrorResponse
{   pub fn new(detail: impl Into<String>) -> Self
    {   ErrorResponse
        {   detail: detail.into()
        }
    }
}

/// Outcome of a routing-service call: success and failure are values of
/// the same type, never an `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse<T>
{   Success(T)
  , Error(ErrorResponse)
}

impl<T> ApiResponse<T>
{   pub fn is_success(&self) -> bool
    {   matches!(self, ApiResponse::Success(_))
    }

    pub fn success(&self) -> Option<&T>
    {   match self
        {   ApiResponse::Success(t) => Some(t)
          , ApiResponse::Error(_) => None
        }
    }

    pub fn error(&self) -> Option<&ErrorResponse>
    {   match self
        {   ApiResponse::Success(_) => None
          , ApiResponse::Error(e) => Some(e)
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U>
    {   match self
        {   ApiResponse::Success(t) => ApiResponse::Success(f(t))
          , ApiResponse::Error(e) => ApiResponse::Error(e)
        }
    }

    /// Success value, or the detail as `Error::Remote`
    pub fn into_result(self) -> Result<T, Error>
    {   match self
        {   ApiResponse::Success(t) => Ok(t)
          , ApiResponse::Error(e) => Err(Error::Remote(e.detail))
        }
    }
}

impl<T: DeserializeOwned> ApiResponse<T>
{   /// Discriminate a response body by the presence of `detail`.
    /// A non-string detail is kept as its JSON text.
    pub fn from_value(value: Value) -> Self
    {   if let Some(detail) = value.get("detail")
        {   let detail = match detail
            {   Value::String(s) => s.clone()
              , other => other.to_string()
            };
            return ApiResponse::Error(ErrorResponse { detail });
        }
        match serde_json::from_value::<T>(value)
        {   Ok(t) => ApiResponse::Success(t)
          , Err(e) => ApiResponse::Error(ErrorResponse::new(
              format!("malformed response: {}", e)
            ))
        }
    }
}

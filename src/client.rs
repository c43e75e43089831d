use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};

use crate::{Message, Provider};
use crate::config::{ClientConfig, EmptyRankingPolicy};
use crate::dispatch::{Dispatcher, InvokeRequest};
use crate::error::{Error, Result};
use crate::normalize::TextStream;
use crate::registry;
use crate::request::{
  AccuracyFeedback, ApiResponse, DefaultProvider, ErrorResponse
, FeedbackResponse, LatencyFeedback, LatencyResponse, MetricRequest
, ModelSelectRequest, PreferenceResponse, ProviderDescriptor
, SelectOptions, SelectionResult
};
use crate::transport::{
  Transport, FEEDBACK_PATH, LATENCY_PATH, MODEL_SELECT_PATH
, PREFERENCE_CREATE_PATH
};

pub const EMPTY_RANKING_DETAIL: &str = "routing service returned no providers";

/// Select-then-call request for `create`
#[derive(Debug, Clone, Default)]
pub struct CreateRequest
{   pub messages: Vec<Message>
  , pub candidates: Vec<ProviderDescriptor>
  , /// Ranking options; `tools` and `response_model` also reach the
    /// selected back end
    pub options: SelectOptions
  , pub credentials: HashMap<Provider, String>
}

impl CreateRequest
{   pub fn new(
      messages: Vec<Message>
    , candidates: Vec<ProviderDescriptor>
    ) -> Self
    {   CreateRequest
        {   messages
          , candidates
          , ..CreateRequest::default()
        }
    }

    pub fn with_options(mut self, options: SelectOptions) -> Self
    {   self.options = options;
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

    fn invoke_request(&self) -> InvokeRequest
    {   InvokeRequest
        {   messages: self.messages.clone()
          , candidates: self.candidates.clone()
          , tools: self.options.tools.clone()
          , response_schema: self.options.response_model.clone()
          , credentials: self.credentials.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateResponse
{   pub content: String
  , /// Provider that actually answered
    pub provider: ProviderDescriptor
  , pub session_id: String
}

pub struct CreateStream
{   pub provider: ProviderDescriptor
  , pub session_id: String
  , pub stream: TextStream
}

/// Client for the routing service
#[derive(Debug, Clone)]
pub struct NotDiamond
{   config: Arc<ClientConfig>
  , transport: Transport
  , dispatcher: Dispatcher
}

impl NotDiamond
{   pub fn new(config: ClientConfig) -> Result<Self>
    {   if config.api_key.trim().is_empty()
        {   error!("No routing API key configured");
            return Err(Error::InvalidConfiguration(
              "api_key is empty".to_string()
            ));
        }
        let http = reqwest::Client::builder()
          .build()
          .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        debug!("Creating NotDiamond client for {}", config.base_url);

        let config = Arc::new(config);
        Ok(NotDiamond
        {   transport: Transport::new(config.clone(), http.clone())
          , dispatcher: Dispatcher::new(config.clone(), http)
          , config
        })
    }

    pub fn from_env() -> Result<Self>
    {   NotDiamond::new(ClientConfig::from_env())
    }

    pub fn config(&self) -> &ClientConfig
    {   &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher
    {   &self.dispatcher
    }

    /// Ask the router to rank `candidates` for `messages`.
    ///
    /// Caller mistakes fail locally as `Err` without touching the network;
    /// anything the service (or the connection) reports comes back as
    /// `ApiResponse::Error`.
    pub async fn model_select(
      &self
    , messages: &[Message]
    , candidates: &[ProviderDescriptor]
    , options: &SelectOptions
    ) -> Result<ApiResponse<SelectionResult>>
    {   let response = self.select_ranked(messages, candidates, options).await?;
        Ok(match response
        {   ApiResponse::Success(selection) if selection.providers.is_empty() => {
              warn!("Empty ranking for session {}", selection.session_id);
              ApiResponse::Error(ErrorResponse::new(EMPTY_RANKING_DETAIL))
            }
          , other => other
        })
    }

    async fn select_ranked(
      &self
    , messages: &[Message]
    , candidates: &[ProviderDescriptor]
    , options: &SelectOptions
    ) -> Result<ApiResponse<SelectionResult>>
    {   validate_select(messages, candidates, options)?;

        let body = ModelSelectRequest::new(messages, candidates, options);
        let deadline = Duration::try_from_secs_f64(options.timeout_secs())
          .map_err(|e| Error::Validation(format!("timeout: {}", e)))?
          .saturating_add(self.config.ranking_grace());
        debug!(
          "model_select over {} candidates (timeout {}s)",
          candidates.len(),
          options.timeout_secs()
        );

        let response: ApiResponse<SelectionResult> = self.transport
          .post(MODEL_SELECT_PATH, &body, deadline)
          .await;
        match &response
        {   ApiResponse::Success(selection) => {
              info!(
                "Session {}: {} ranked providers",
                selection.session_id,
                selection.providers.len()
              );
            }
          , ApiResponse::Error(e) => {
              error!("model_select failed: {}", e.detail);
            }
        }
        Ok(response)
    }

    /// Report how good the answer from `provider` was for a session
    pub async fn feedback(
      &self
    , session_id: &str
    , provider: &ProviderDescriptor
    , accuracy: f64
    ) -> ApiResponse<FeedbackResponse>
    {   debug!("feedback for session {}: {}", session_id, accuracy);
        let body = MetricRequest
        {   session_id
          , feedback: AccuracyFeedback { accuracy }
          , provider
        };
        self.transport
          .post(FEEDBACK_PATH, &body, self.config.request_timeout())
          .await
    }

    /// Report observed throughput of `provider` for a session
    pub async fn latency(
      &self
    , session_id: &str
    , provider: &ProviderDescriptor
    , tokens_per_second: f64
    ) -> ApiResponse<LatencyResponse>
    {   debug!(
          "latency for session {}: {} tok/s",
          session_id,
          tokens_per_second
        );
        let body = MetricRequest
        {   session_id
          , feedback: LatencyFeedback { tokens_per_second }
          , provider
        };
        self.transport
          .post(LATENCY_PATH, &body, self.config.request_timeout())
          .await
    }

    /// Create a preference profile to pass as `preference_id` later
    pub async fn create_preference_id(&self) -> ApiResponse<PreferenceResponse>
    {   debug!("Creating preference id");
        self.transport
          .post(
            PREFERENCE_CREATE_PATH,
            &serde_json::json!({}),
            self.config.request_timeout()
          )
          .await
    }

    /// Rank, then call the top provider directly
    pub async fn create(&self, request: CreateRequest) -> Result<CreateResponse>
    {   let (provider, session_id) = self.select_for_dispatch(&request).await?;
        let content = self.dispatcher
          .invoke(&provider, &request.invoke_request())
          .await?;
        Ok(CreateResponse
        {   content
          , provider
          , session_id
        })
    }

    /// Rank, then stream from the top provider
    pub async fn create_stream(&self, request: CreateRequest) -> Result<CreateStream>
    {   let (provider, session_id) = self.select_for_dispatch(&request).await?;
        let stream = self.dispatcher
          .invoke_stream(&provider, &request.invoke_request())
          .await?;
        Ok(CreateStream
        {   provider
          , session_id
          , stream
        })
    }

    async fn select_for_dispatch(
      &self
    , request: &CreateRequest
    ) -> Result<(ProviderDescriptor, String)>
    {   let selection = self
          .select_ranked(&request.messages, &request.candidates, &request.options)
          .await?
          .into_result()?;

        let provider = match selection.providers.into_iter().next()
        {   Some(top) => top
          , None => match &self.config.empty_ranking
            {   EmptyRankingPolicy::Fail => {
                  error!("Empty ranking for session {}", selection.session_id);
                  return Err(Error::Remote(EMPTY_RANKING_DETAIL.to_string()));
                }
              , EmptyRankingPolicy::UseProvider(fallback) => {
                  warn!("Empty ranking; using configured provider {}", fallback);
                  fallback.clone()
                }
            }
        };
        info!("Dispatching session {} to {}", selection.session_id, provider);
        Ok((provider, selection.session_id))
    }
}

/// Local checks run before a ranking request is sent
pub fn validate_select(
  messages: &[Message]
, candidates: &[ProviderDescriptor]
, options: &SelectOptions
) -> Result<()>
{   if candidates.is_empty()
    {   error!("model_select called without candidates");
        return Err(Error::Validation(
          "at least one candidate provider is required".to_string()
        ));
    }
    if messages.is_empty()
    {   return Err(Error::Validation(
          "at least one message is required".to_string()
        ));
    }
    for candidate in candidates
    {   registry::validate(candidate)?;
    }

    match &options.default
    {   DefaultProvider::ByIndex(i) if *i >= candidates.len() => {
          return Err(Error::Validation(format!(
            "default index {} out of range for {} candidates",
            i,
            candidates.len()
          )));
        }
      , DefaultProvider::ByDescriptor(d) => {
          registry::validate(d)?;
        }
      , _ => {}
    }

    if let Some(timeout) = options.timeout
    {   if !timeout.is_finite() || timeout <= 0.0
        {   return Err(Error::Validation(format!(
              "timeout must be a positive number of seconds, got {}",
              timeout
            )));
        }
    }
    if options.max_model_depth == Some(0)
    {   return Err(Error::Validation(
          "max_model_depth must be at least 1".to_string()
        ));
    }
    Ok(())
}

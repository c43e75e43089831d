//! JSON-over-HTTPS transport to the routing service.
//!
//! One attempt per call. Connection failures, non-2xx statuses, malformed
//! bodies and local deadline expiry all come back as
//! `ApiResponse::Error`; nothing here returns `Err`.

use std::sync::Arc;
use std::time::Duration;
use log::{debug, trace, error};
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::ClientConfig;
use crate::request::{ApiResponse, ErrorResponse};

pub const MODEL_SELECT_PATH: &str = "/v2/modelRouter/modelSelect";
pub const FEEDBACK_PATH: &str = "/v2/report/metrics/feedback";
pub const LATENCY_PATH: &str = "/v2/report/metrics/latency";
pub const PREFERENCE_CREATE_PATH: &str = "/v2/preferences/userPreferenceCreate";

#[derive(Debug, Clone)]
pub struct Transport
{   config: Arc<ClientConfig>
  , http: reqwest::Client
}

impl Transport
{   pub fn new(config: Arc<ClientConfig>, http: reqwest::Client) -> Self
    {   Transport
        {   config
          , http
        }
    }

    /// POST `body` to `path` under the configured base URL
    pub async fn post<B, T>(
      &self
    , path: &str
    , body: &B
    , deadline: Duration
    ) -> ApiResponse<T>
    where
      B: Serialize + ?Sized
    , T: DeserializeOwned
    {   let url = self.config.endpoint(path);
        debug!("POST {} (deadline {:?})", url, deadline);
        if log::log_enabled!(log::Level::Trace)
        {   trace!(
              "Request body: {}",
              serde_json::to_string(body).unwrap_or_default()
            );
        }

        match tokio::time::timeout(deadline, self.send(&url, body)).await
        {   Ok(response) => response
          , Err(_) => {
              error!("POST {} timed out after {:?}", url, deadline);
              ApiResponse::Error(ErrorResponse::new(format!(
                "request to {} timed out after {:.1}s",
                path,
                deadline.as_secs_f64()
              )))
            }
        }
    }

    async fn send<B, T>(&self, url: &str, body: &B) -> ApiResponse<T>
    where
      B: Serialize + ?Sized
    , T: DeserializeOwned
    {   let response = match self.http
          .post(url)
          .bearer_auth(&self.config.api_key)
          .header(ACCEPT, "application/json")
          .header(CONTENT_TYPE, "application/json")
          .header(USER_AGENT, &self.config.user_agent)
          .json(body)
          .send()
          .await
        {   Ok(r) => r
          , Err(e) => {
              error!("HTTP error: {}", e);
              return ApiResponse::Error(ErrorResponse::new(
                format!("request failed: {}", e)
              ));
            }
        };

        let status = response.status();
        trace!("Response status: {}", status);

        let text = match response.text().await
        {   Ok(t) => t
          , Err(e) => {
              error!("Failed to read response body: {}", e);
              return ApiResponse::Error(ErrorResponse::new(
                format!("failed to read response body: {}", e)
              ));
            }
        };
        trace!("Response body: {}", text);

        let value: Value = match serde_json::from_str(&text)
        {   Ok(v) => v
          , Err(e) => {
              error!("Unparseable response ({}): {}", status, e);
              let detail = if status.is_success()
              {   format!("malformed JSON response: {}", e)
              } else
              {   format!("HTTP {}: {}", status.as_u16(), text)
              };
              return ApiResponse::Error(ErrorResponse::new(detail));
            }
        };

        if !status.is_success() && value.get("detail").is_none()
        {   error!("HTTP {} without detail", status);
            return ApiResponse::Error(ErrorResponse::new(
              format!("HTTP {}: {}", status.as_u16(), text)
            ));
        }

        ApiResponse::from_value(value)
    }
}

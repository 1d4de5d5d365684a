//! AI advisor implementations

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{AdvisorError, AiAdvisor};
use crate::agent::arbitration::ArbitrationContext;
use crate::config::AdvisorConfig;

/// Posts the arbitration context as JSON and returns the response body
pub struct HttpAdvisor {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpAdvisor {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AdvisorError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdvisorError::Request(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.into(),
            http_client,
        })
    }

    /// `None` when no endpoint is configured
    pub fn from_config(config: &AdvisorConfig) -> Result<Option<Self>, AdvisorError> {
        match &config.endpoint {
            Some(endpoint) => {
                Self::new(endpoint.clone(), Duration::from_millis(config.timeout_ms)).map(Some)
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AiAdvisor for HttpAdvisor {
    async fn recommend(&self, context: &ArbitrationContext) -> Result<String, AdvisorError> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(context)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdvisorError::Timeout
                } else {
                    AdvisorError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdvisorError::Request(format!("HTTP {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AdvisorError::Request(e.to_string()))?;
        debug!(
            "Advisor answered for {} ({} bytes)",
            context.position.position_id,
            body.len()
        );
        Ok(body)
    }
}

/// Advisor that always holds; deterministic exits keep protecting positions
#[derive(Debug, Default, Clone, Copy)]
pub struct HoldAdvisor;

#[async_trait]
impl AiAdvisor for HoldAdvisor {
    async fn recommend(&self, _context: &ArbitrationContext) -> Result<String, AdvisorError> {
        Ok(r#"{"action":"HOLD","reasoning":"no advisor configured"}"#.to_string())
    }
}

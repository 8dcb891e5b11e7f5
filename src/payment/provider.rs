use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Intent-creation request sent to the provider. Amounts are minor units;
/// metadata correlates the intent back to the reservation.
#[derive(Debug, Clone, Serialize)]
pub struct IntentRequest {
    pub amount: i64,
    pub currency: String,
    /// Our correlation reference — the reservation id.
    pub reference: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentResponse {
    pub intent_id: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug)]
pub enum ProviderError {
    Http(String),
    /// Provider answered with a non-success status.
    Rejected { status: u16, body: String },
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Http(e) => write!(f, "provider request failed: {e}"),
            ProviderError::Rejected { status, body } => {
                write!(f, "provider rejected intent (HTTP {status}): {body}")
            }
        }
    }
}

impl std::error::Error for ProviderError {}

/// Seam to the external payment provider. Mocked in tests; the HTTP
/// implementation below is the production path.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_intent(&self, req: &IntentRequest) -> Result<IntentResponse, ProviderError>;
}

/// JSON-over-HTTP provider client: `POST {endpoint}/intents` with a bearer
/// key, bounded timeout.
pub struct HttpPaymentProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpPaymentProvider {
    pub fn new(endpoint: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("motorpool/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_intent(&self, req: &IntentRequest) -> Result<IntentResponse, ProviderError> {
        let url = format!("{}/intents", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(req)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<IntentResponse>()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))
    }
}

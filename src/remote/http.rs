use crate::error::AppError;
use crate::models::{ConsumeRequest, ConsumeResponse, EntitlementState, PurchaseRecord, UsageSnapshot};
use crate::remote::EntitlementBackend;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Adapter for the hosted entitlement service.
pub struct HttpBackend {
    client: Client,
    base: Url,
    token: String,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        token: String,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()?;
        let base = Url::parse(base_url.trim())?;
        if base.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "Backend URL '{base_url}' cannot carry a path."
            )));
        }
        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn endpoint(&self, user_id: &str, tail: &str) -> Result<Url, AppError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AppError::Config("Backend URL cannot carry a path.".into()))?;
            segments
                .pop_if_empty()
                .extend(["v1", "users", user_id, tail]);
        }
        Ok(url)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, AppError> {
        let response = req
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;

        let status = response.status();
        debug!(url = %response.url(), %status, "entitlement service replied");
        if status.is_server_error() {
            return Err(AppError::Network(format!(
                "entitlement service returned HTTP {status}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl EntitlementBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch_usage_snapshot(&self, user_id: &str) -> Result<UsageSnapshot, AppError> {
        let url = self.endpoint(user_id, "usage")?;
        let response = self.send(self.client.get(url)).await?;
        Ok(response.error_for_status()?.json().await?)
    }

    async fn consume_action(
        &self,
        user_id: &str,
        request: ConsumeRequest,
    ) -> Result<ConsumeResponse, AppError> {
        let url = self.endpoint(user_id, "consume")?;
        let response = self.send(self.client.post(url).json(&request)).await?;
        Ok(response.error_for_status()?.json().await?)
    }

    async fn load_profile(&self, user_id: &str) -> Result<Option<EntitlementState>, AppError> {
        let url = self.endpoint(user_id, "profile")?;
        let response = self.send(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn upsert_profile(&self, state: &EntitlementState) -> Result<(), AppError> {
        let url = self.endpoint(&state.user_id, "profile")?;
        let response = self.send(self.client.put(url).json(state)).await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(AppError::PersistenceConflict(
                "entitlement service rejected the profile write (HTTP 409)".into(),
            ));
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn append_purchase(&self, user_id: &str, record: &PurchaseRecord) -> Result<(), AppError> {
        let url = self.endpoint(user_id, "purchases")?;
        let response = self.send(self.client.post(url).json(record)).await?;
        response.error_for_status()?;
        Ok(())
    }

    async fn list_purchases(&self, user_id: &str) -> Result<Vec<PurchaseRecord>, AppError> {
        let url = self.endpoint(user_id, "purchases")?;
        let response = self.send(self.client.get(url)).await?;
        Ok(response.error_for_status()?.json().await?)
    }
}

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rearch::CapsuleHandle;
use reqwest::{Client, StatusCode, header::AUTHORIZATION};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::config::{ProviderConfig, provider_config_capsule};

/// Request body for creating a link at the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CreateProviderLink {
    pub domain: String,
    #[serde(rename = "originalURL")]
    pub original_url: String,
    pub path: String,
    pub title: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderLink {
    pub short_url: String,
    pub provider_link_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("path is already taken at the provider")]
    PathTaken,
    #[error("provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("provider response did not include a short URL")]
    MalformedResponse,
    #[error("failed to reach the provider: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ProviderError {
    fn from_message(status: StatusCode, message: String) -> Self {
        if message.to_ascii_lowercase().contains("already exists") {
            Self::PathTaken
        } else {
            Self::Rejected {
                status: status.as_u16(),
                message,
            }
        }
    }
}

pub fn link_provider_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn LinkProvider> {
    let config = get.as_ref(provider_config_capsule).clone();
    Arc::new(ShortIoProvider::new(config))
}

#[async_trait]
pub trait LinkProvider: Send + Sync {
    async fn create_link(&self, request: &CreateProviderLink) -> Result<ProviderLink, ProviderError>;

    /// Deletes the link at the provider. A link that no longer exists counts as deleted.
    async fn delete_link(&self, provider_link_id: &str) -> Result<(), ProviderError>;
}

/// Short.io links API client.
pub struct ShortIoProvider {
    client: Client,
    api_base: Url,
    secret_key: String,
}

impl ShortIoProvider {
    /// # Panics
    /// Panics when the TLS backend cannot be initialized.
    #[must_use]
    pub fn new(
        ProviderConfig {
            api_base,
            secret_key,
            timeout,
            ..
        }: ProviderConfig,
    ) -> Self {
        Self {
            client: build_client(timeout),
            api_base,
            secret_key,
        }
    }

    fn links_url(&self, segment: Option<&str>) -> String {
        let base = self.api_base.as_str().trim_end_matches('/');
        match segment {
            Some(segment) => format!("{base}/links/{segment}"),
            None => format!("{base}/links"),
        }
    }
}

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .expect("reqwest client should build with rustls")
}

/// Subset of the Short.io link payload, shared by success and error bodies.
#[derive(Debug, Default, Deserialize)]
struct LinkResponse {
    #[serde(rename = "shortURL")]
    short_url: Option<String>,
    #[serde(rename = "idString")]
    id_string: Option<String>,
    id: Option<serde_json::Value>,
    error: Option<String>,
    message: Option<String>,
}

impl LinkResponse {
    fn provider_link_id(&self) -> Option<String> {
        self.id_string.clone().or_else(|| match &self.id {
            Some(serde_json::Value::String(id)) => Some(id.clone()),
            Some(serde_json::Value::Number(id)) => Some(id.to_string()),
            _ => None,
        })
    }
}

#[async_trait]
impl LinkProvider for ShortIoProvider {
    #[instrument(skip(self), fields(path = %request.path))]
    async fn create_link(&self, request: &CreateProviderLink) -> Result<ProviderLink, ProviderError> {
        let response = self
            .client
            .post(self.links_url(None))
            .header(AUTHORIZATION, &self.secret_key)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        // NOTE: the provider sometimes answers errors with a non-JSON body
        let parsed: LinkResponse = serde_json::from_str(&body).unwrap_or_default();
        debug!(%status, "Provider answered create request");

        if let Some(message) = parsed.error.clone() {
            return Err(ProviderError::from_message(status, message));
        }
        if !status.is_success() {
            let message = parsed.message.clone().unwrap_or(body);
            return Err(ProviderError::from_message(status, message));
        }

        let provider_link_id = parsed.provider_link_id();
        match parsed.short_url {
            Some(short_url) => Ok(ProviderLink {
                short_url,
                provider_link_id,
            }),
            None => Err(ProviderError::MalformedResponse),
        }
    }

    #[instrument(skip(self))]
    async fn delete_link(&self, provider_link_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.links_url(Some(provider_link_id)))
            .header(AUTHORIZATION, &self.secret_key)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(%status, "Provider link deleted");
            return Ok(());
        }

        let body = response.text().await?;
        let parsed: LinkResponse = serde_json::from_str(&body).unwrap_or_default();
        Err(ProviderError::Rejected {
            status: status.as_u16(),
            message: parsed.error.or(parsed.message).unwrap_or(body),
        })
    }
}

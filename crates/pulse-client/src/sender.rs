use async_trait::async_trait;
use thiserror::Error;

use pulse_types::action::{HttpMethod, PendingAction};
use pulse_types::config::QueueConfig;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("server responded {status}: {body}")]
    Status { status: u16, body: String },
}

/// Delivers one queued action to the backend.
#[async_trait]
pub trait ActionSender: Send + Sync {
    async fn send(&self, action: &PendingAction) -> Result<(), SendError>;
}

/// Sends actions to the REST API, authenticated by a static key header.
pub struct HttpActionSender {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    api_key_header: String,
}

impl HttpActionSender {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_key_header: config.api_key_header.clone(),
        }
    }

    pub fn url_for(&self, action: &PendingAction) -> String {
        format!("{}{}", self.base_url, action.endpoint.target().path)
    }
}

#[async_trait]
impl ActionSender for HttpActionSender {
    async fn send(&self, action: &PendingAction) -> Result<(), SendError> {
        let target = action.endpoint.target();
        let url = self.url_for(action);
        let mut request = match target.method {
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };
        if let Some(key) = &self.api_key {
            request = request.header(self.api_key_header.as_str(), key);
        }

        let response = request
            .json(&action.body)
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use tally_shared::pii::Masked;

use crate::error::ProviderError;
use crate::templates::{EmailContent, WhatsAppTemplate};

/// Sends e-mail. Returns the provider's message id.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, recipient: &str, content: &EmailContent) -> Result<String, ProviderError>;
}

/// Sends WhatsApp messages. Returns the provider's message id.
#[async_trait]
pub trait WhatsAppProvider: Send + Sync {
    async fn send_template(&self, recipient: &str, template: &WhatsAppTemplate) -> Result<String, ProviderError>;

    async fn send_text(&self, recipient: &str, body: &str) -> Result<String, ProviderError>;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn read_failure(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ProviderError::from_status(status, body)
}

/// JSON e-mail API in the style of Resend/Postmark: bearer key, `{from, to, subject, text}`.
pub struct HttpEmailProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    from: String,
}

#[derive(Deserialize)]
struct EmailAccepted {
    id: String,
}

impl HttpEmailProvider {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, from: impl Into<String>) -> Result<Self, ProviderError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            from: from.into(),
        })
    }
}

#[async_trait]
impl EmailProvider for HttpEmailProvider {
    async fn send(&self, recipient: &str, content: &EmailContent) -> Result<String, ProviderError> {
        debug!("Sending e-mail to {}", Masked(recipient));

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [recipient],
                "subject": content.subject,
                "text": content.body,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(read_failure(response).await);
        }

        let accepted: EmailAccepted = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("unreadable provider response: {}", e)))?;
        Ok(accepted.id)
    }
}

/// WhatsApp Cloud API (`POST {endpoint}/{phone_number_id}/messages`).
pub struct WhatsAppCloudProvider {
    http: reqwest::Client,
    endpoint: String,
    access_token: String,
    phone_number_id: String,
    language: String,
}

#[derive(Deserialize)]
struct CloudAccepted {
    messages: Vec<CloudMessage>,
}

#[derive(Deserialize)]
struct CloudMessage {
    id: String,
}

impl WhatsAppCloudProvider {
    pub fn new(
        endpoint: impl Into<String>,
        access_token: impl Into<String>,
        phone_number_id: impl Into<String>,
        language: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            endpoint: endpoint.into(),
            access_token: access_token.into(),
            phone_number_id: phone_number_id.into(),
            language: language.into(),
        })
    }

    async fn post(&self, body: serde_json::Value) -> Result<String, ProviderError> {
        let url = format!("{}/{}/messages", self.endpoint.trim_end_matches('/'), self.phone_number_id);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(read_failure(response).await);
        }

        let accepted: CloudAccepted = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("unreadable provider response: {}", e)))?;
        accepted
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| ProviderError::Transient("provider returned no message id".to_string()))
    }
}

#[async_trait]
impl WhatsAppProvider for WhatsAppCloudProvider {
    async fn send_template(&self, recipient: &str, template: &WhatsAppTemplate) -> Result<String, ProviderError> {
        debug!("Sending WhatsApp template {} to {}", template.name, Masked(recipient));

        let parameters: Vec<serde_json::Value> = template
            .params
            .iter()
            .map(|p| json!({ "type": "text", "text": p }))
            .collect();

        self.post(json!({
            "messaging_product": "whatsapp",
            "to": recipient,
            "type": "template",
            "template": {
                "name": template.name,
                "language": { "code": self.language },
                "components": [{ "type": "body", "parameters": parameters }],
            },
        }))
        .await
    }

    async fn send_text(&self, recipient: &str, body: &str) -> Result<String, ProviderError> {
        debug!("Sending WhatsApp text to {}", Masked(recipient));

        self.post(json!({
            "messaging_product": "whatsapp",
            "to": recipient,
            "type": "text",
            "text": { "body": body },
        }))
        .await
    }
}

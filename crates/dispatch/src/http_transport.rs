//! Messaging transport over an HTTP gateway.
//!
//! The gateway owns the paired sessions. Per connection it exposes:
//! - `POST {base}/connections/{id}/messages` → `{"id": ".."}`
//! - `POST {base}/connections/{id}/exists` → `{"exists": bool, "jid": ".."}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransportError;
use crate::model::Connection;
use crate::ports::{ExistsResult, MessagingTransport, OutboundContent};

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum SendBody<'a> {
    Text {
        to: &'a str,
        body: &'a str,
    },
    #[serde(rename_all = "camelCase")]
    Media {
        to: &'a str,
        url: &'a str,
        file_name: &'a str,
        mime_type: Option<&'a str>,
        caption: Option<&'a str>,
    },
}

impl<'a> SendBody<'a> {
    fn new(to: &'a str, content: &'a OutboundContent) -> Self {
        match content {
            OutboundContent::Text(body) => SendBody::Text { to, body },
            OutboundContent::Media { attachment, caption } => SendBody::Media {
                to,
                url: &attachment.url,
                file_name: &attachment.file_name,
                mime_type: attachment.mime_type.as_deref(),
                caption: caption.as_deref(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct ExistsRequest<'a> {
    number: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExistsResponse {
    exists: bool,
    #[serde(default)]
    jid: Option<String>,
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, connection: &Connection, action: &str) -> String {
        format!(
            "{}/connections/{}/{action}",
            self.config.base_url.trim_end_matches('/'),
            connection.id
        )
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(&self, url: String, body: &B) -> Result<R, TransportError> {
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_decode() {
        TransportError::InvalidResponse(e.to_string())
    } else {
        TransportError::Unavailable(e.to_string())
    }
}

fn status_error(status: StatusCode, body: String) -> TransportError {
    let detail = format!("{status}: {body}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        TransportError::Unavailable(detail)
    } else {
        TransportError::Rejected(detail)
    }
}

#[async_trait]
impl MessagingTransport for HttpTransport {
    async fn send(&self, connection: &Connection, destination: &str, content: &OutboundContent) -> Result<String, TransportError> {
        let response: SendResponse = self
            .post(self.url(connection, "messages"), &SendBody::new(destination, content))
            .await?;
        debug!(connection_id = %connection.id, message_id = %response.id, "gateway accepted message");
        Ok(response.id)
    }

    async fn check_exists(&self, connection: &Connection, number: &str) -> Result<ExistsResult, TransportError> {
        let response: ExistsResponse = self
            .post(self.url(connection, "exists"), &ExistsRequest { number })
            .await?;
        Ok(ExistsResult {
            exists: response.exists,
            normalized_id: response.jid,
        })
    }
}

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::protocol::{MessageRecord, SendMessageRequest, SendMessageResponse};
use tracing::debug;
use url::Url;

use crate::error::{ConfigError, HistoryLoadError, SendError};

/// Request/response half of the chat service.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_history(&self, token: Option<&str>)
        -> Result<Vec<MessageRecord>, HistoryLoadError>;

    async fn submit_message(
        &self,
        token: Option<&str>,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, SendError>;
}

#[derive(Debug, Clone)]
pub struct HttpChatApi {
    http: Client,
    chat_url: String,
}

impl HttpChatApi {
    pub fn new(server_url: &Url, timeout: Duration) -> Result<Self, ConfigError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ConfigError::HttpClient(err.to_string()))?;
        Ok(Self::with_client(http, server_url))
    }

    pub fn with_client(http: Client, server_url: &Url) -> Self {
        Self {
            http,
            chat_url: format!("{}/api/chat", server_url.as_str().trim_end_matches('/')),
        }
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }
}

fn authorized(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, String> {
    let body = response.bytes().await.map_err(|err| err.to_string())?;
    serde_json::from_slice(&body).map_err(|err| err.to_string())
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_history(
        &self,
        token: Option<&str>,
    ) -> Result<Vec<MessageRecord>, HistoryLoadError> {
        let response = authorized(self.http.get(&self.chat_url), token)
            .send()
            .await
            .map_err(|err| HistoryLoadError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HistoryLoadError::Status {
                status: status.as_u16(),
            });
        }

        let records: Vec<MessageRecord> = read_json(response)
            .await
            .map_err(HistoryLoadError::Malformed)?;
        debug!(count = records.len(), "api: fetched history");
        Ok(records)
    }

    async fn submit_message(
        &self,
        token: Option<&str>,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, SendError> {
        let response = authorized(self.http.post(&self.chat_url), token)
            .json(request)
            .send()
            .await
            .map_err(|err| SendError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SendError::Status {
                status: status.as_u16(),
            });
        }

        let ack: SendMessageResponse = read_json(response)
            .await
            .map_err(|err| SendError::Rejected(format!("unreadable acknowledgement: {err}")))?;
        if !ack.is_ack() {
            return Err(SendError::Rejected(
                ack.msg.unwrap_or_else(|| "missing acknowledgement".to_string()),
            ));
        }
        Ok(ack)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;

use futures::stream::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response, header};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};
use crate::transport::{ByteStream, ChatTransport, DEFAULT_TIMEOUT, TurnOptions};

const DEFAULT_API_URL: &str = "http://localhost:8000/api/";

/// HTTP client for the chat backend.
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: ReqwestClient,
    base_url: Url,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    user_input: &'a str,
    session_id: &'a str,
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

impl ChatClient {
    /// Create a new client.
    ///
    /// The base URL is read from the PARLEY_API_URL environment variable, falling back to a
    /// backend on localhost.
    pub fn new() -> Result<Self> {
        let base_url = env::var("PARLEY_API_URL").ok();
        Self::with_options(base_url, None)
    }

    /// Create a new client with custom settings.
    pub fn with_options(base_url: Option<String>, timeout: Option<Duration>) -> Result<Self> {
        let base_url = base_url.unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let base_url = Url::parse(&with_trailing_slash(&base_url))?;
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        // Body deadlines are enforced per turn; the client only bounds connection setup.
        let client = ReqwestClient::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// The backend base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The configured turn deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers
    }

    /// Convert a transport failure into our Error type.
    fn map_send_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::timeout(
                format!("Request timed out: {e}"),
                Some(self.timeout.as_secs_f64()),
            )
        } else if e.is_connect() {
            Error::network(format!("Connection error: {e}"), Some(Box::new(e)))
        } else {
            Error::network(format!("Request failed: {e}"), Some(Box::new(e)))
        }
    }

    /// Reject non-success statuses without reading the body.
    fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let reason = status.canonical_reason().unwrap_or("request failed");
            Err(Error::api(status.as_u16(), reason))
        }
    }
}

#[async_trait::async_trait]
impl ChatTransport for ChatClient {
    async fn create_session(&self) -> Result<String> {
        let url = self.endpoint("create_chat")?;
        let response = self
            .client
            .post(url)
            .headers(Self::default_headers())
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = Self::check_status(response)?;
        let body = response.json::<CreateSessionResponse>().await.map_err(|e| {
            Error::serialization(
                format!("Failed to parse session response: {e}"),
                Some(Box::new(e)),
            )
        })?;
        tracing::info!(session_id = %body.session_id, "created session");
        Ok(body.session_id)
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("delete_session/{session_id}"))?;
        let response = self
            .client
            .delete(url)
            .headers(Self::default_headers())
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        Self::check_status(response)?;
        tracing::info!(session_id, "deleted session");
        Ok(())
    }

    async fn open_chat(&self, user_input: &str, session_id: &str) -> Result<ByteStream> {
        let url = self.endpoint("chat")?;
        let response = self
            .client
            .post(url)
            .headers(Self::default_headers())
            .json(&ChatRequest {
                user_input,
                session_id,
            })
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = Self::check_status(response)?;

        let timeout = self.timeout;
        let body = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(
                        format!("Timed out reading stream: {e}"),
                        Some(timeout.as_secs_f64()),
                    )
                } else {
                    Error::network(format!("Error in HTTP stream: {e}"), Some(Box::new(e)))
                }
            })
        });
        Ok(Box::pin(body))
    }

    fn turn_options(&self) -> TurnOptions {
        TurnOptions::with_timeout(self.timeout)
    }
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_creation() {
        let client = ChatClient::with_options(None, None).unwrap();
        assert_eq!(client.base_url().as_str(), DEFAULT_API_URL);
        assert_eq!(client.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(
            client.turn_options(),
            TurnOptions::with_timeout(DEFAULT_TIMEOUT)
        );

        let client = ChatClient::with_options(
            Some("https://chat.example.com/api".to_string()),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(client.base_url().as_str(), "https://chat.example.com/api/");
        assert_eq!(client.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn endpoints_join_base() {
        let client =
            ChatClient::with_options(Some("https://chat.example.com/api/".to_string()), None)
                .unwrap();
        assert_eq!(
            client.endpoint("delete_session/abc").unwrap().as_str(),
            "https://chat.example.com/api/delete_session/abc"
        );
        assert_eq!(
            client.endpoint("chat").unwrap().as_str(),
            "https://chat.example.com/api/chat"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = ChatClient::with_options(Some("not a url".to_string()), None).unwrap_err();
        assert!(matches!(err, Error::Url { .. }));
    }

    #[tokio::test]
    async fn unreachable_backend_is_network_error() {
        let client = ChatClient::with_options(
            Some("http://127.0.0.1:9/api/".to_string()),
            Some(Duration::from_secs(2)),
        )
        .unwrap();
        let err = client.create_session().await.unwrap_err();
        assert!(err.is_network() || err.is_timeout());
    }
}

use std::time::Duration;

use reqwest::{header, Client};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::error::AuthorizationError;

/// Source of the bearer token for the current session. Read-only from the
/// client's point of view.
pub trait TokenProvider: Send + Sync {
    fn auth_token(&self) -> Option<String>;
}

pub struct StaticTokenProvider(pub Option<String>);

impl TokenProvider for StaticTokenProvider {
    fn auth_token(&self) -> Option<String> {
        self.0.clone()
    }
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn auth_token(&self) -> Option<String> {
        self()
    }
}

#[derive(Debug, Serialize)]
struct ChannelAuthRequest<'a> {
    socket_id: &'a str,
    channel_name: &'a str,
}

/// Performs the `broadcasting/auth` handshake for private channels.
#[derive(Clone)]
pub struct AuthorizationClient {
    http: Client,
    endpoint: Url,
    timeout: Duration,
}

impl AuthorizationClient {
    pub fn new(endpoint: Url, timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            endpoint,
            timeout,
        }
    }

    /// Returns the JSON object the broker expects in `pusher:subscribe`.
    pub async fn authorize(
        &self,
        token: &str,
        socket_id: &str,
        channel: &str,
    ) -> Result<Map<String, Value>, AuthorizationError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(token)
            .header(header::ACCEPT, "application/json")
            .json(&ChannelAuthRequest {
                socket_id,
                channel_name: channel,
            })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| self.request_error(channel, source))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthorizationError::Rejected {
                channel: channel.to_string(),
                status: status.as_u16(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|source| self.request_error(channel, source))?;
        debug!(channel, socket_id, "realtime: channel authorized");
        match body {
            Value::Object(auth) => Ok(auth),
            _ => Err(AuthorizationError::InvalidResponse {
                channel: channel.to_string(),
            }),
        }
    }

    fn request_error(&self, channel: &str, source: reqwest::Error) -> AuthorizationError {
        if source.is_timeout() {
            AuthorizationError::Timeout {
                channel: channel.to_string(),
                timeout: self.timeout,
            }
        } else {
            AuthorizationError::Request {
                channel: channel.to_string(),
                source,
            }
        }
    }
}

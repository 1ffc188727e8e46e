//! HTTP transport over reqwest.

use std::sync::{PoisonError, RwLock};

use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wire::{ChannelKey, Event};

use crate::audio::{ClipResolver, PlaybackError};
use crate::transport::{
    ByteStream, Credentials, PublishRequest, QueryRequest, Transport, TransportError,
};

/// Builder for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportBuilder {
    base_url: String,
    credentials: Option<Credentials>,
    client: Option<reqwest::Client>,
}

impl HttpTransportBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            credentials: None,
            client: None,
        }
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Use a preconfigured client (proxies, TLS roots, ...).
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> HttpTransport {
        HttpTransport {
            client: self.client.unwrap_or_default(),
            base_url: self.base_url.trim_end_matches('/').to_string(),
            credentials: RwLock::new(self.credentials),
        }
    }
}

/// Talks to a parley server over HTTP.
///
/// Every request carries `Authorization: Bearer <token>` and `X-Username`
/// once credentials are set.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    credentials: RwLock<Option<Credentials>>,
}

#[derive(Serialize)]
struct ChannelRequest<'a> {
    channel: &'a ChannelKey,
}

#[derive(Serialize)]
struct ChannelContextRequest<'a> {
    channel: &'a ChannelKey,
    text: &'a str,
}

/// `GET /personas` answers with a bare list of persona names, or with the
/// personas and plain channels split apart.
#[derive(Deserialize)]
#[serde(untagged)]
enum ChannelsResponse {
    Names(Vec<String>),
    Split {
        #[serde(default)]
        personas: Vec<String>,
        #[serde(default)]
        channels: Vec<String>,
    },
}

impl ChannelsResponse {
    fn into_keys(self) -> Vec<ChannelKey> {
        let (personas, channels) = match self {
            Self::Names(names) => (names, Vec::new()),
            Self::Split { personas, channels } => (personas, channels),
        };
        personas
            .into_iter()
            .map(|name| {
                if name.starts_with(['@', '#']) {
                    ChannelKey::new(name)
                } else {
                    ChannelKey::new(format!("@{name}"))
                }
            })
            .chain(channels.into_iter().map(ChannelKey::new))
            .collect()
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    history: Option<Vec<serde_json::Value>>,
}

impl HttpTransport {
    pub fn builder(base_url: impl Into<String>) -> HttpTransportBuilder {
        HttpTransportBuilder::new(base_url)
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Exchange a username and password for a token, and start using it.
    pub async fn login(&self, username: &str, password: &str) -> Result<Credentials, TransportError> {
        let response = self
            .send(
                self.request(Method::POST, "login")
                    .json(&LoginRequest { username, password }),
            )
            .await?;
        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        let credentials = Credentials::new(username, login.token);
        self.set_credentials(Some(credentials.clone()));
        Ok(credentials)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}/{path}", self.base_url));
        match self.credentials() {
            Some(credentials) => req
                .bearer_auth(&credentials.token)
                .header("X-Username", &credentials.username),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, TransportError> {
        let response = req
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    fn body_stream(response: Response) -> ByteStream {
        Box::pin(
            response
                .bytes_stream()
                .map_err(|e| TransportError::Network(e.to_string())),
        )
    }
}

impl Transport for HttpTransport {
    async fn subscribe(&self) -> Result<ByteStream, TransportError> {
        debug!(url = %self.base_url, "subscribing");
        let response = self
            .send(
                self.request(Method::GET, "subscribe")
                    .header("Accept", "text/event-stream"),
            )
            .await?;
        Ok(Self::body_stream(response))
    }

    async fn publish(&self, request: &PublishRequest) -> Result<(), TransportError> {
        let response = self
            .send(self.request(Method::POST, "publish").json(request))
            .await?;
        // The acknowledgement body carries nothing we need, but it must be JSON.
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(())
    }

    async fn query(&self, request: &QueryRequest) -> Result<ByteStream, TransportError> {
        let response = self
            .send(self.request(Method::POST, "query").json(request))
            .await?;
        Ok(Self::body_stream(response))
    }

    async fn history(&self, channel: &ChannelKey) -> Result<Option<Vec<Event>>, TransportError> {
        let response = self
            .send(
                self.request(Method::POST, "conversation_history")
                    .json(&ChannelRequest { channel }),
            )
            .await?;
        let body: HistoryResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        Ok(body.history.map(|items| {
            items
                .into_iter()
                .filter_map(|item| match Event::from_value(item) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(%channel, error = %e, "dropping history item");
                        None
                    }
                })
                .collect()
        }))
    }

    async fn reset(&self, channel: &ChannelKey) -> Result<(), TransportError> {
        self.send(
            self.request(Method::POST, "reset")
                .json(&ChannelRequest { channel }),
        )
        .await?;
        Ok(())
    }

    async fn channels(&self) -> Result<Vec<ChannelKey>, TransportError> {
        let response = self.send(self.request(Method::GET, "personas")).await?;
        let body: Option<ChannelsResponse> = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(body.map(ChannelsResponse::into_keys).unwrap_or_default())
    }

    async fn add_channel_context(&self, channel: &ChannelKey, text: &str) -> Result<(), TransportError> {
        self.send(
            self.request(Method::POST, "channel_context")
                .json(&ChannelContextRequest { channel, text }),
        )
        .await?;
        Ok(())
    }

    fn set_credentials(&self, credentials: Option<Credentials>) {
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = credentials;
    }
}

impl ClipResolver for HttpTransport {
    async fn fetch(&self, location: &str) -> Result<Bytes, PlaybackError> {
        let response = self
            .send(self.request(Method::GET, &format!("voice/{location}")))
            .await
            .map_err(|e| PlaybackError::Fetch(e.to_string()))?;
        response
            .bytes()
            .await
            .map_err(|e| PlaybackError::Fetch(e.to_string()))
    }
}

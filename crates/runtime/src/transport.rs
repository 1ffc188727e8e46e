//! The seam between the session and the server.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use thiserror::Error;
use wire::{ChannelKey, Event};

/// Raw response body, chunked however the network delivers it.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// HTTP 401 on any call.
    #[error("unauthorized")]
    Unauthorized,

    #[error("network error: {0}")]
    Network(String),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Who we are to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }
}

/// Body of `POST /publish`.
#[derive(Debug, Clone, Serialize)]
pub struct PublishRequest {
    pub query: String,
    pub channel: ChannelKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Body of `POST /query`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRequest {
    pub query: String,
    pub persona: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Everything the session needs from the server.
///
/// A 401 on any call must be reported as [`TransportError::Unauthorized`];
/// the session treats it as the single "credentials are no longer valid"
/// signal.
pub trait Transport: Send + Sync + 'static {
    /// Open the long-lived push stream.
    fn subscribe(&self) -> impl Future<Output = Result<ByteStream, TransportError>> + Send;

    /// Post a message to a channel. Resolves on the server's acknowledgement.
    fn publish(
        &self,
        request: &PublishRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Ask a persona a question; the reply streams back in the body.
    fn query(
        &self,
        request: &QueryRequest,
    ) -> impl Future<Output = Result<ByteStream, TransportError>> + Send;

    /// The server's copy of a channel's history, if it has one.
    fn history(
        &self,
        channel: &ChannelKey,
    ) -> impl Future<Output = Result<Option<Vec<Event>>, TransportError>> + Send;

    /// Forget the server-side conversation for a channel.
    fn reset(&self, channel: &ChannelKey)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Channels and personas this user may address. Personas come back as
    /// `@name` keys.
    fn channels(&self) -> impl Future<Output = Result<Vec<ChannelKey>, TransportError>> + Send;

    /// Attach a note to a channel that the server feeds to its personas.
    fn add_channel_context(
        &self,
        channel: &ChannelKey,
        text: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Replace (or clear, with `None`) the credentials sent with every call.
    fn set_credentials(&self, credentials: Option<Credentials>);
}

//! Typed events decoded from the push stream.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{ParseError, Result};

/// Identifier of a conversation context: a named channel (`#general`) or a
/// direct addressee (`@leah`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Direct addressees are prefixed with `@`.
    pub fn is_direct(&self) -> bool {
        self.0.starts_with('@')
    }

    /// The addressee name without its `@` prefix, for direct keys.
    pub fn persona(&self) -> Option<&str> {
        self.0.strip_prefix('@')
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ChannelKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Opaque reference to an audio clip, as announced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioRef(String);

impl AudioRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AudioRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    System,
    Assistant,
    User,
    Direct,
    End,
    ConversationId,
    History,
    Break,
    Audio,
    /// The server ended a voice call. Carries nothing to display.
    Hangup,
}

impl EventKind {
    /// Parse a wire `type` value.
    pub fn parse(kind: &str) -> Option<Self> {
        let kind = match kind {
            // The push server tags channel broadcasts `channel`.
            "message" | "channel" => Self::Message,
            "system" => Self::System,
            "assistant" => Self::Assistant,
            "user" => Self::User,
            "direct" => Self::Direct,
            "end" => Self::End,
            "conversation_id" => Self::ConversationId,
            "history" => Self::History,
            "break" => Self::Break,
            "audio" => Self::Audio,
            "hangup" => Self::Hangup,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::User => "user",
            Self::Direct => "direct",
            Self::End => "end",
            Self::ConversationId => "conversation_id",
            Self::History => "history",
            Self::Break => "break",
            Self::Audio => "audio",
            Self::Hangup => "hangup",
        }
    }

    /// Control events steer the stream but are never stored as entries.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::End | Self::Break | Self::ConversationId | Self::History | Self::Hangup
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an event carries. Text and audio are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "body", content = "value", rename_all = "snake_case")]
pub enum Body {
    Text(String),
    Audio(AudioRef),
    Empty,
}

/// A single event from the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub body: Body,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_channel: Option<ChannelKey>,
    /// Epoch seconds.
    pub sent_at: i64,
    /// Nested events of a `history` event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Event>,
}

impl Event {
    pub fn new(kind: EventKind, body: Body) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            body,
            from_user: None,
            via_channel: None,
            sent_at: Utc::now().timestamp(),
            history: Vec::new(),
        }
    }

    /// A text event of the given kind.
    pub fn text(kind: EventKind, content: impl Into<String>) -> Self {
        Self::new(kind, Body::Text(content.into()))
    }

    /// An audio notification.
    pub fn audio(reference: impl Into<String>) -> Self {
        Self::new(EventKind::Audio, Body::Audio(AudioRef::new(reference)))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<ChannelKey>) -> Self {
        self.via_channel = Some(channel.into());
        self
    }

    pub fn with_sender(mut self, from_user: impl Into<String>) -> Self {
        self.from_user = Some(from_user.into());
        self
    }

    pub fn content(&self) -> Option<&str> {
        match &self.body {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn audio_ref(&self) -> Option<&AudioRef> {
        match &self.body {
            Body::Audio(reference) => Some(reference),
            _ => None,
        }
    }

    /// Parse one frame payload.
    pub fn from_json(payload: &str) -> Result<Self> {
        let frame: WireFrame = serde_json::from_str(payload)?;
        frame.into_event()
    }

    /// Parse an already-decoded JSON value, such as an item of an HTTP
    /// response body.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let frame: WireFrame = serde_json::from_value(value)?;
        frame.into_event()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Event ids arrive as strings or numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Number(i64),
    String(String),
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    id: Option<WireId>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    from_user: Option<String>,
    #[serde(default)]
    via_channel: Option<String>,
    #[serde(default)]
    sent_at: Option<f64>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    history: Option<Vec<serde_json::Value>>,
}

impl WireFrame {
    fn into_event(self) -> Result<Event> {
        let kind = match self.kind.as_deref() {
            Some(name) => match EventKind::parse(name) {
                Some(kind) => kind,
                // Anything else that has something to show is a plain message.
                None if self.content.as_deref().is_some_and(|c| !c.is_empty()) => {
                    debug!(kind = name, "treating unknown event type as a message");
                    EventKind::Message
                }
                None => return Err(ParseError::UnknownKind(name.to_string())),
            },
            // Untyped frames: `{filename}` audio notices and bare `{content}`
            // continuations of a streamed reply.
            None if self.filename.is_some() && self.content.is_none() => EventKind::Audio,
            None if self.content.is_some() => EventKind::Assistant,
            None if self.history.is_some() => EventKind::History,
            None => return Err(ParseError::MissingKind),
        };

        let body = match (self.content, self.filename) {
            (Some(text), _) if !text.is_empty() => Body::Text(text),
            (_, Some(file)) => Body::Audio(AudioRef::new(file)),
            _ => Body::Empty,
        };

        let id = match self.id {
            Some(WireId::String(id)) => id,
            Some(WireId::Number(id)) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let history = self
            .history
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| {
                let parsed = serde_json::from_value::<WireFrame>(item)
                    .map_err(ParseError::from)
                    .and_then(WireFrame::into_event);
                match parsed {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(error = %e, "dropping history item");
                        None
                    }
                }
            })
            .collect();

        Ok(Event {
            id,
            kind,
            body,
            from_user: self.from_user,
            via_channel: self.via_channel.map(ChannelKey::from),
            sent_at: self
                .sent_at
                .map(|secs| secs as i64)
                .unwrap_or_else(|| Utc::now().timestamp()),
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_message() {
        let event = Event::from_json(
            r##"{"type":"message","id":"m1","content":"hi","from_user":"ana","via_channel":"#random","sent_at":1700000000}"##,
        )
        .unwrap();
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.id, "m1");
        assert_eq!(event.content(), Some("hi"));
        assert_eq!(event.via_channel, Some(ChannelKey::from("#random")));
        assert_eq!(event.from_user.as_deref(), Some("ana"));
        assert_eq!(event.sent_at, 1_700_000_000);
    }

    #[test]
    fn numeric_id_becomes_string() {
        let event = Event::from_json(r#"{"type":"system","id":42,"content":"x"}"#).unwrap();
        assert_eq!(event.id, "42");
    }

    #[test]
    fn missing_id_is_generated() {
        let a = Event::from_json(r#"{"type":"user","content":"x"}"#).unwrap();
        let b = Event::from_json(r#"{"type":"user","content":"x"}"#).unwrap();
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn filename_frame_is_audio() {
        let event = Event::from_json(r#"{"filename":"voice_1.mp3"}"#).unwrap();
        assert_eq!(event.kind, EventKind::Audio);
        assert_eq!(event.audio_ref().map(AudioRef::as_str), Some("voice_1.mp3"));
        assert_eq!(event.content(), None);
    }

    #[test]
    fn untyped_content_is_assistant_continuation() {
        let event = Event::from_json(r#"{"content":"Hello"}"#).unwrap();
        assert_eq!(event.kind, EventKind::Assistant);
        assert_eq!(event.content(), Some("Hello"));
    }

    #[test]
    fn content_wins_over_filename() {
        let event = Event::from_json(r#"{"type":"message","content":"hi","filename":"a.mp3"}"#).unwrap();
        assert_eq!(event.content(), Some("hi"));
        assert!(event.audio_ref().is_none());
    }

    #[test]
    fn empty_content_is_empty_body() {
        let event = Event::from_json(r#"{"type":"break","content":""}"#).unwrap();
        assert_eq!(event.kind, EventKind::Break);
        assert_eq!(event.body, Body::Empty);
    }

    #[test]
    fn conversation_id_carries_id() {
        let event = Event::from_json(r#"{"type":"conversation_id","id":"c-7"}"#).unwrap();
        assert_eq!(event.kind, EventKind::ConversationId);
        assert_eq!(event.id, "c-7");
        assert!(event.kind.is_control());
    }

    #[test]
    fn history_items_are_nested_and_bad_items_skipped() {
        let event = Event::from_json(
            r#"{"type":"history","history":[{"type":"user","id":"1","content":"q"},{"type":"bogus"},{"type":"assistant","id":"2","content":"a"}]}"#,
        )
        .unwrap();
        assert_eq!(event.kind, EventKind::History);
        let ids: Vec<_> = event.history.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["1", "2"]);
    }

    #[test]
    fn server_channel_broadcast_is_a_message() {
        let event = Event::from_json(
            r##"{"sent_at":1700000000.5,"id":"x","from_user":"@leah","via_channel":"#general","content":"hi all","type":"channel","thread":null}"##,
        )
        .unwrap();
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.id, "x");
        assert_eq!(event.content(), Some("hi all"));
        assert_eq!(event.from_user.as_deref(), Some("@leah"));
        assert_eq!(event.via_channel, Some(ChannelKey::from("#general")));
        assert_eq!(event.sent_at, 1_700_000_000);
    }

    #[test]
    fn hangup_is_a_control_event() {
        let event = Event::from_json(
            r##"{"sent_at":1700000000.5,"id":"h","from_user":"@leah","via_channel":"@leah","content":"","type":"hangup","thread":null}"##,
        )
        .unwrap();
        assert_eq!(event.kind, EventKind::Hangup);
        assert!(event.kind.is_control());
        assert_eq!(event.body, Body::Empty);
    }

    #[test]
    fn unknown_type_with_content_falls_back_to_message() {
        let event = Event::from_json(r##"{"type":"announcement","content":"maintenance at 5","via_channel":"#general"}"##)
            .unwrap();
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.content(), Some("maintenance at 5"));
    }

    #[test]
    fn unknown_type_without_content_is_rejected() {
        let err = Event::from_json(r#"{"type":"telemetry"}"#).unwrap_err();
        assert!(matches!(err, ParseError::UnknownKind(kind) if kind == "telemetry"));
    }

    #[test]
    fn shapeless_frame_is_rejected() {
        assert!(matches!(Event::from_json("{}"), Err(ParseError::MissingKind)));
        assert!(matches!(Event::from_json("[1,2]"), Err(ParseError::Json(_))));
    }

    #[test]
    fn history_response_body_parses_from_value() {
        let body = serde_json::json!({
            "history": [{"type": "user", "content": "q"}, {"content": "a"}]
        });
        let event = Event::from_value(body).unwrap();
        assert_eq!(event.kind, EventKind::History);
        let kinds: Vec<_> = event.history.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [EventKind::User, EventKind::Assistant]);
    }

    #[test]
    fn channel_key_direct() {
        let key = ChannelKey::from("@leah");
        assert!(key.is_direct());
        assert_eq!(key.persona(), Some("leah"));
        assert!(!ChannelKey::from("#general").is_direct());
    }
}

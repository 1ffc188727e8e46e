//! Routing policy: which channel an event belongs to.

use serde::{Deserialize, Serialize};
use wire::{ChannelKey, Event, EventKind};

/// How the server addresses events to channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// One long-lived push stream carrying every channel; events name their
    /// channel in `via_channel`, direct messages name the sender.
    #[default]
    Broadcast,
    /// One streamed response per request; events belong to the channel the
    /// request was sent to.
    Conversation,
}

impl RoutingPolicy {
    /// The channel `event` belongs to.
    ///
    /// `in_flight` is the channel of the request being answered, if any.
    /// Events that name no channel at all fall back to the active one.
    pub fn effective_channel(
        &self,
        event: &Event,
        active: &ChannelKey,
        in_flight: Option<&ChannelKey>,
    ) -> ChannelKey {
        let named = match self {
            Self::Broadcast => {
                if event.kind == EventKind::Direct {
                    event.from_user.as_deref().map(direct_key)
                } else {
                    event.via_channel.clone()
                }
            }
            Self::Conversation => event.via_channel.clone().or_else(|| in_flight.cloned()),
        };
        named.unwrap_or_else(|| active.clone())
    }
}

impl std::fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Broadcast => write!(f, "broadcast"),
            Self::Conversation => write!(f, "conversation"),
        }
    }
}

/// Direct addressees are keyed `@name`.
fn direct_key(sender: &str) -> ChannelKey {
    if sender.starts_with('@') {
        ChannelKey::from(sender)
    } else {
        ChannelKey::new(format!("@{sender}"))
    }
}

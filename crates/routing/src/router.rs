//! Per-event routing decisions.

use tracing::{debug, trace};
use wire::{AudioRef, Body, ChannelKey, Event, EventKind};

use crate::{Conversations, RoutingPolicy};

/// Ambient state the router needs besides the conversations themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteContext<'a> {
    /// Channel of the submission currently being answered.
    pub in_flight: Option<&'a ChannelKey>,
    /// Drop audio instead of queueing it.
    pub muted: bool,
}

/// What happened to a routed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Stored in the active context.
    Accepted { channel: ChannelKey },
    /// Stored in an inactive context whose unread counter is now `count`.
    Unread { channel: ChannelKey, count: u32 },
    /// Audio to hand to the playback queue.
    Audio(AudioRef),
    /// Audio dropped because playback is muted.
    Muted(AudioRef),
    /// A streamed reply was closed (`end` or `break`).
    Finalized { channel: ChannelKey, end: bool },
    /// The server assigned a conversation id.
    ConversationStarted { channel: ChannelKey, id: String },
    /// The server sent the full history of a channel.
    HistoryReplaced { channel: ChannelKey, count: usize },
    /// Nothing worth storing (an event without a body).
    Ignored,
}

impl Outcome {
    /// Whether `channel`'s stored entries changed.
    pub fn touched(&self) -> Option<&ChannelKey> {
        match self {
            Self::Accepted { channel }
            | Self::Unread { channel, .. }
            | Self::Finalized { channel, .. }
            | Self::HistoryReplaced { channel, .. } => Some(channel),
            _ => None,
        }
    }
}

/// Files every event under the right conversation.
#[derive(Debug, Clone, Default)]
pub struct ChannelRouter {
    policy: RoutingPolicy,
}

impl ChannelRouter {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Route one event.
    ///
    /// Audio bypasses text routing entirely. System events always land in the
    /// active context. Other text goes to its effective channel, bumping the
    /// unread counter when that channel isn't active.
    pub fn route(
        &self,
        conversations: &mut Conversations,
        event: Event,
        ctx: RouteContext<'_>,
    ) -> Outcome {
        if let Body::Audio(reference) = &event.body {
            return if ctx.muted {
                debug!(audio = %reference, "muted, dropping audio");
                Outcome::Muted(reference.clone())
            } else {
                Outcome::Audio(reference.clone())
            };
        }

        let active = conversations.active_key().clone();
        let channel = self.policy.effective_channel(&event, &active, ctx.in_flight);
        trace!(kind = %event.kind, %channel, %active, "routing event");

        match event.kind {
            EventKind::End | EventKind::Break => {
                conversations.context_mut(&channel).finalize();
                Outcome::Finalized {
                    channel,
                    end: event.kind == EventKind::End,
                }
            }
            EventKind::ConversationId => {
                conversations
                    .context_mut(&channel)
                    .set_conversation_id(event.id.clone());
                Outcome::ConversationStarted {
                    channel,
                    id: event.id,
                }
            }
            EventKind::History => {
                let count = event.history.len();
                conversations.context_mut(&channel).replace_history(event.history);
                Outcome::HistoryReplaced { channel, count }
            }
            EventKind::Hangup => {
                debug!(%channel, "call ended");
                Outcome::Ignored
            }
            _ if event.body == Body::Empty => Outcome::Ignored,
            EventKind::System => {
                conversations.active_mut().attach_system(event);
                Outcome::Accepted { channel: active }
            }
            _ if channel == active => {
                conversations.active_mut().push_text(event);
                Outcome::Accepted { channel }
            }
            _ => {
                let context = conversations.context_mut(&channel);
                context.push_text(event);
                let count = context.bump_unread();
                Outcome::Unread { channel, count }
            }
        }
    }
}

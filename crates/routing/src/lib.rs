//! Event routing for parley.
//!
//! Core principle: **every event lands in exactly one place.** It is either
//! stored in the active conversation, filed as unread under another one,
//! or handed to the audio side channel.
//!
//! The server has two ways of addressing events (one push stream carrying
//! all channels, or one streamed response per request). Both are captured
//! by [`RoutingPolicy`], so the [`ChannelRouter`] has a single code path.

mod context;
mod policy;
mod router;

pub use context::{ConversationContext, Conversations, Entry};
pub use policy::RoutingPolicy;
pub use router::{ChannelRouter, Outcome, RouteContext};

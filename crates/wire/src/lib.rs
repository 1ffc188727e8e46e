//! Wire format of the parley push stream.
//!
//! The server speaks a server-sent-events dialect: every frame is a
//! `data: <json>` line followed by a blank line. This crate owns the typed
//! [`Event`] model and the [`FrameDecoder`] that turns arbitrary network
//! reads into events.
//!
//! # Example
//!
//! ```
//! use wire::{EventKind, FrameDecoder};
//!
//! let mut decoder = FrameDecoder::new();
//! assert!(decoder.push(b"data: {\"type\":\"message\",\"con").is_empty());
//!
//! let events = decoder.push(b"tent\":\"hi\",\"via_channel\":\"#general\"}\n\n");
//! let event = events.into_iter().next().unwrap()?;
//! assert_eq!(event.kind, EventKind::Message);
//! assert_eq!(event.content(), Some("hi"));
//! # Ok::<(), wire::ParseError>(())
//! ```

mod error;
mod event;
mod frame;

pub use error::{ParseError, Result};
pub use event::{AudioRef, Body, ChannelKey, Event, EventKind};
pub use frame::{FrameDecoder, decode_stream};

//! Parley runtime: the resilient stream client.
//!
//! This crate keeps a chat client connected to its server and turns the
//! event stream into conversation state.
//!
//! # Overview
//!
//! - **Transport**: the seam to the server. [`HttpTransport`] implements it
//!   with reqwest; tests use in-memory fakes.
//! - **ReconnectSupervisor**: the connection state machine. It decides when
//!   to connect, when to retry and when to give up (only on a 401).
//! - **SubmissionQueue**: at most one user submission in flight, strict FIFO.
//! - **AudioPlaybackQueue**: plays announced clips one at a time, in order.
//! - **StreamSession**: the actor composing all of the above behind a
//!   cloneable [`SessionHandle`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use runtime::{Credentials, HttpTransport, Notification, StreamSession};
//!
//! # async fn example() -> runtime::Result<()> {
//! let transport = Arc::new(HttpTransport::builder("http://localhost:5000").build());
//! let session = StreamSession::builder(transport)
//!     .channel("#general")
//!     .credentials(Credentials::new("ana", "token"))
//!     .spawn()?;
//!
//! let mut notifications = session.notifications();
//! session.submit("hello", None).await?;
//! while let Ok(notification) = notifications.recv().await {
//!     if let Notification::Routed(outcome) = notification {
//!         println!("{outcome:?}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
mod error;
mod http;
mod session;
mod submission;
mod supervisor;
mod transport;

pub use error::{Error, Result};
pub use http::{HttpTransport, HttpTransportBuilder};
pub use session::{Notification, SessionBuilder, SessionHandle, StreamSession};
pub use submission::{Submission, SubmissionQueue};
pub use supervisor::{
    Attempt, ConnectionState, Directive, Disconnect, ReconnectPolicy, ReconnectSupervisor,
};
pub use transport::{
    ByteStream, Credentials, PublishRequest, QueryRequest, Transport, TransportError,
};

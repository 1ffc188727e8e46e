//! Key-value snapshot storage for parley clients.
//!
//! The client persists a small amount of state between runs: which channel
//! was active, whether audio was muted, and the contents of every
//! conversation context. None of it needs a schema beyond "string key,
//! string value", so that is all the [`SnapshotStore`] contract offers.
//!
//! Two implementations ship here:
//!
//! - [`SqliteSnapshotStore`]: a single SQLite table, for the CLI.
//! - [`MemorySnapshotStore`]: a locked `HashMap`, for tests and ephemeral runs.
//!
//! # Example
//!
//! ```
//! use storage::{SnapshotStore, SqliteSnapshotStore, load, save};
//!
//! let store = SqliteSnapshotStore::in_memory()?;
//! save(&store, "muted", &true)?;
//! assert_eq!(load::<bool>(&store, "muted")?, Some(true));
//!
//! store.remove("muted")?;
//! assert_eq!(store.get("muted")?, None);
//! # Ok::<(), storage::Error>(())
//! ```

mod error;
mod snapshot;
mod sqlite;

pub use error::{Error, Result};
pub use snapshot::{MemorySnapshotStore, SnapshotStore, load, save};
pub use sqlite::SqliteSnapshotStore;

//! Crosspost - scheduled cross-posting to X, note and WordPress
//!
//! Posts are written to a SQLite store with a target platform and an
//! optional schedule. Each dispatch cycle, started by an external trigger,
//! claims the posts that are due, publishes them one at a time and records
//! the outcome with retry and backoff bookkeeping.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod platforms;
pub mod quota;
pub mod scheduling;
pub mod server;
pub mod spool;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::{Database, PostFilter, QueueStats, StatusPatch};
pub use dispatcher::{CycleReport, DispatchSettings, Dispatcher, Outcome, PostResult};
pub use error::{CrosspostError, ErrorKind, PlatformError, Result};
pub use types::{NewPost, PlatformKind, PostStatus, Published, ScheduledPost, Source};

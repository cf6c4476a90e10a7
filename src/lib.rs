//! `git-mirror`: maintains local bare mirrors of remote git repositories
//! and publishes named, pinned worktree checkouts ("worktree links") for
//! other processes to read from.
//!
//! A small set of focused modules under `src/`, re-exported from here,
//! with the daemon binary in `src/main.rs` thin over the library.

pub mod auth;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod naming;
pub mod parse;
pub mod pool;
pub mod reconciler;
pub mod subprocess;
pub mod url;

pub use cancel::{CancelToken, Deadline};
pub use config::Config;
pub use engine::{Engine, EngineDeps};
pub use error::{Error, Result};
pub use pool::Pool;
pub use reconciler::Reconciler;

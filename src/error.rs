use camino::Utf8PathBuf;
use thiserror::Error;

/// Sentinel error kinds returned across the engine/pool/reconciler boundary.
///
/// Internal detail (subprocess stderr, io errors, ...) is logged at the call
/// site with the operation name; callers only ever see one of these kinds.
#[derive(Debug, Error)]
pub enum Error {
    #[error("repository or link not found: {0}")]
    NotExist(String),

    #[error("already exists: {0}")]
    Exist(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("mirror failed for {remote}: {reason}")]
    MirrorFailed { remote: String, reason: String },

    /// A `git` subprocess exited non-zero for an operation other than
    /// init/fetch (reads, clone, cleanup housekeeping). Unlike
    /// `MirrorFailed`, this does not imply the mirror directory will be
    /// wiped and reinitialised on the next cycle.
    #[error("command failed in {cwd}: {reason}")]
    CommandFailed { cwd: String, reason: String },

    #[error("worktree update failed for {remote}/{link}: {reason}")]
    WorktreeUpdateFailed {
        remote: String,
        link: String,
        reason: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("unparsable remote url: {0}")]
    BadRemote(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

//! Fetching updates from `origin` into the bare mirror.

use crate::cancel::Deadline;
use crate::error::{Error, Result};
use crate::parse::{parse_fetch_porcelain, FetchUpdate};

use super::Engine;

impl Engine {
    pub(crate) fn fetch(&self, deadline: &Deadline) -> Result<Vec<FetchUpdate>> {
        log::debug!("{}: fetching", self.normalised);
        let env = self.env_for_remote()?;
        let out = self
            .run(
                &[
                    "-c",
                    "gc.auto=0",
                    "fetch",
                    "origin",
                    "--prune",
                    "--no-progress",
                    "--porcelain",
                ],
                &env,
                deadline,
            )
            .map_err(|e| match e {
                Error::CommandFailed { reason, .. } => Error::MirrorFailed {
                    remote: self.normalised.clone(),
                    reason,
                },
                other => other,
            })?;
        Ok(parse_fetch_porcelain(&out))
    }

    /// Resolves `reference` (branch, tag, or full hash) to the commit hash
    /// it currently points to in the mirror.
    pub(crate) fn resolve_ref(&self, reference: &str, deadline: &Deadline) -> Result<String> {
        let env = self.env_for_remote()?;
        let out = self.run(
            &["rev-parse", "--verify", &format!("{reference}^{{commit}}")],
            &env,
            deadline,
        )?;
        Ok(out.trim().to_string())
    }
}

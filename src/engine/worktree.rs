//! `EnsureWorktree` and `EnsureWorktreeLink`: materialise each desired
//! link's checkout, then publish its symlink.

use std::collections::HashMap;

use camino::Utf8PathBuf;

use crate::cancel::Deadline;
use crate::error::{Error, Result};
use crate::naming::{publish_symlink, tracker_name, worktree_dir_name};

use super::{Engine, EngineState};

const WORKTREES_DIR: &str = ".worktrees";

impl Engine {
    pub(crate) fn worktrees_root(&self) -> Utf8PathBuf {
        self.mirror_dir.join(WORKTREES_DIR)
    }

    /// Resolves every desired link's ref, (re)materialises its worktree if
    /// needed, and returns the resolved `(link name -> worktree dir)` map.
    /// Any single failure aborts with `WorktreeUpdateFailed`; cleanup is
    /// skipped for the whole cycle in that case.
    ///
    /// Takes the engine's own write guard (acquired once by `Mirror` for
    /// the whole cycle) rather than locking itself, since `std::sync::RwLock`
    /// is not reentrant.
    pub(crate) fn ensure_worktrees(
        &self,
        state: &EngineState,
        deadline: &Deadline,
    ) -> Result<HashMap<String, Utf8PathBuf>> {
        let desired: Vec<_> = state.links.values().cloned().collect();
        let mut resolved = HashMap::new();

        for link in &desired {
            let hash = self
                .resolve_ref(&link.desired.reference, deadline)
                .map_err(|e| Error::WorktreeUpdateFailed {
                    remote: self.normalised.clone(),
                    link: link.desired.link.clone(),
                    reason: format!("could not resolve ref {:?}: {e}", link.desired.reference),
                })?;

            let wt_dir_name = worktree_dir_name(&link.link_abs, &hash);
            let wt_path = self.worktrees_root().join(&wt_dir_name);

            let needs_recreate = !self.worktree_is_current(&link.link_abs, &wt_path, deadline);
            if needs_recreate {
                self.materialise_worktree(&wt_path, &hash, &link.desired.pathspecs, deadline)
                    .map_err(|e| Error::WorktreeUpdateFailed {
                        remote: self.normalised.clone(),
                        link: link.desired.link.clone(),
                        reason: e.to_string(),
                    })?;
            }
            resolved.insert(link.desired.link.clone(), wt_path);
        }

        Ok(resolved)
    }

    /// `true` if `link_abs` already resolves to `wt_path` and `wt_path`
    /// passes the sanity check (non-empty, inside-work-tree, root
    /// matches, fsck-connectivity).
    fn worktree_is_current(
        &self,
        link_abs: &camino::Utf8Path,
        wt_path: &camino::Utf8Path,
        deadline: &Deadline,
    ) -> bool {
        let current_target = std::fs::read_link(link_abs.as_str())
            .ok()
            .and_then(|target| {
                let target = camino::Utf8PathBuf::try_from(target).ok()?;
                let resolved = if target.is_absolute() {
                    target
                } else {
                    link_abs.parent()?.join(target)
                };
                std::fs::canonicalize(resolved.as_str())
                    .ok()
                    .and_then(|p| camino::Utf8PathBuf::try_from(p).ok())
            });

        let Some(current_target) = current_target else {
            return false;
        };
        let Ok(wt_path_canon) = std::fs::canonicalize(wt_path.as_str())
            .and_then(|p| camino::Utf8PathBuf::try_from(p).map_err(|_| std::io::ErrorKind::InvalidData.into()))
        else {
            return false;
        };
        if current_target != wt_path_canon {
            return false;
        }

        self.worktree_sanity_check(wt_path, deadline).is_ok()
    }

    fn worktree_sanity_check(
        &self,
        wt_path: &camino::Utf8Path,
        deadline: &Deadline,
    ) -> Result<()> {
        if !wt_path.is_dir() || wt_path.read_dir().map(|mut d| d.next().is_none()).unwrap_or(true) {
            return Err(Error::ValidationFailed(format!("{wt_path} is empty or missing")));
        }
        let inside = self
            .run_in(wt_path, &["rev-parse", "--is-inside-work-tree"], &[], deadline)?
            .trim()
            == "true";
        if !inside {
            return Err(Error::ValidationFailed(format!("{wt_path} is not inside a work tree")));
        }
        let toplevel = self
            .run_in(wt_path, &["rev-parse", "--show-toplevel"], &[], deadline)?
            .trim()
            .to_string();
        if std::fs::canonicalize(&toplevel).ok() != std::fs::canonicalize(wt_path.as_str()).ok() {
            return Err(Error::ValidationFailed(format!("{wt_path} worktree root mismatch")));
        }
        self.run_in(wt_path, &["fsck", "--connectivity-only"], &[], deadline)?;
        Ok(())
    }

    fn materialise_worktree(
        &self,
        wt_path: &camino::Utf8Path,
        hash: &str,
        pathspecs: &[String],
        deadline: &Deadline,
    ) -> Result<()> {
        if wt_path.exists() {
            std::fs::remove_dir_all(wt_path.as_str()).map_err(|e| Error::io(wt_path.to_path_buf(), e))?;
        }
        if let Some(parent) = wt_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent.to_path_buf(), e))?;
        }

        self.run(
            &[
                "worktree",
                "add",
                "--force",
                "--detach",
                "--no-checkout",
                wt_path.as_str(),
                hash,
            ],
            &[],
            deadline,
        )?;

        let mut checkout_args = vec!["checkout", hash];
        if !pathspecs.is_empty() {
            checkout_args.push("--");
            for p in pathspecs {
                checkout_args.push(p.as_str());
            }
        }
        self.run_in(wt_path, &checkout_args, &[], deadline)?;
        Ok(())
    }

    /// Publishes a symlink for every desired link whose target changed,
    /// after all worktrees have been ensured, so either every link in the
    /// cycle is published or none are.
    pub(crate) fn ensure_worktree_links(
        &self,
        state: &mut EngineState,
        resolved: &HashMap<String, Utf8PathBuf>,
    ) -> Result<()> {
        for (name, wt_path) in resolved {
            let Some(live) = state.links.get_mut(name) else {
                continue;
            };
            let current = std::fs::read_link(live.link_abs.as_str()).ok();
            let already_published = current
                .as_ref()
                .map(|c| resolves_to(&live.link_abs, c, wt_path))
                .unwrap_or(false);

            if !already_published {
                publish_symlink(&live.link_abs, wt_path)?;
            }

            let wt_dir_name = wt_path
                .file_name()
                .ok_or_else(|| Error::ValidationFailed(format!("{wt_path} has no file name")))?;
            let tracker_path = wt_path
                .parent()
                .ok_or_else(|| Error::ValidationFailed(format!("{wt_path} has no parent")))?
                .join(tracker_name(wt_dir_name));
            publish_symlink(&tracker_path, &live.link_abs)?;

            live.worktree_dir = Some(wt_path.clone());
        }
        Ok(())
    }
}

fn resolves_to(link_abs: &camino::Utf8Path, raw_target: &std::path::Path, wt_path: &camino::Utf8Path) -> bool {
    let Ok(target) = camino::Utf8PathBuf::try_from(raw_target.to_path_buf()) else {
        return false;
    };
    let resolved = if target.is_absolute() {
        target
    } else {
        match link_abs.parent() {
            Some(p) => p.join(target),
            None => return false,
        }
    };
    std::fs::canonicalize(resolved.as_str()).ok().and_then(|p| camino::Utf8PathBuf::try_from(p).ok())
        == std::fs::canonicalize(wt_path.as_str()).ok().and_then(|p| camino::Utf8PathBuf::try_from(p).ok())
}

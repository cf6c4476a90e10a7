//! `Cleanup`: stale tracker/link removal, stale `.worktrees/` entries,
//! prune, reflog expiry, GC.

use std::collections::HashSet;

use crate::cancel::Deadline;
use crate::config::GcMode;
use crate::error::Result;

use super::{Engine, EngineState};

#[derive(Debug, Default, Clone)]
pub struct CleanupReport {
    pub trackers_removed: usize,
    pub links_removed: usize,
    pub stale_worktree_entries_removed: usize,
}

impl Engine {
    /// Removes on-disk state for links no longer in the desired set, then
    /// prunes/reflog-expires/GCs the mirror. Must only be called after a
    /// successful `ensure_worktrees` + `ensure_worktree_links`, holding the
    /// same write guard `Mirror` acquired for the cycle — cleanup never
    /// runs if worktree ensuring reported errors.
    pub(crate) fn cleanup(&self, state: &EngineState, deadline: &Deadline) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let worktrees_root = self.worktrees_root();
        if !worktrees_root.is_dir() {
            return Ok(report);
        }

        let desired_link_paths: HashSet<String> =
            state.links.values().map(|l| l.link_abs.to_string()).collect();

        // (a) tracker symlinks whose target link is no longer desired;
        // remove the target link too if it still points at the matching
        // worktree (guards a concurrent re-bind).
        let mut live_names = HashSet::new();
        for link in state.links.values() {
            if let Some(dir) = &link.worktree_dir {
                if let Some(name) = dir.file_name() {
                    live_names.insert(name.to_string());
                    live_names.insert(crate::naming::tracker_name(name));
                }
            }
        }

        for entry in std::fs::read_dir(worktrees_root.as_str())
            .map_err(|e| crate::error::Error::io(worktrees_root.clone(), e))?
        {
            let entry = entry.map_err(|e| crate::error::Error::io(worktrees_root.clone(), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();

            let Some(tracked_dir_name) = name.strip_suffix("-link-tracker") else {
                continue;
            };
            let tracker_path = entry.path();
            let Ok(target) = std::fs::read_link(&tracker_path) else {
                continue;
            };
            let Some(target_str) = target.to_str() else { continue };
            let target_abs = if target.is_absolute() {
                target_str.to_string()
            } else {
                tracker_path
                    .parent()
                    .map(|p| p.join(target_str))
                    .and_then(|p| p.to_str().map(str::to_string))
                    .unwrap_or_default()
            };

            if !desired_link_paths.contains(&target_abs) {
                let _ = std::fs::remove_file(&tracker_path);
                report.trackers_removed += 1;

                // remove the published link only if it still points at this
                // specific worktree dir (not one a concurrent rebind published)
                if let Ok(link_current) = std::fs::read_link(&target_abs) {
                    if link_current
                        .file_name()
                        .map(|n| n.to_string_lossy() == tracked_dir_name)
                        .unwrap_or(false)
                    {
                        let _ = std::fs::remove_file(&target_abs);
                        report.links_removed += 1;
                    }
                }
            }
        }

        // (b) any `.worktrees/` entry that isn't a live worktree dir or its
        // tracker.
        for entry in std::fs::read_dir(worktrees_root.as_str())
            .map_err(|e| crate::error::Error::io(worktrees_root.clone(), e))?
        {
            let entry = entry.map_err(|e| crate::error::Error::io(worktrees_root.clone(), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !live_names.contains(&name) {
                let path = entry.path();
                if path.is_dir() {
                    let _ = std::fs::remove_dir_all(&path);
                } else {
                    let _ = std::fs::remove_file(&path);
                }
                report.stale_worktree_entries_removed += 1;
            }
        }

        self.run(&["worktree", "prune", "--verbose"], &[], deadline)?;
        self.run(
            &["reflog", "expire", "--expire-unreachable=all", "--all"],
            &[],
            deadline,
        )?;
        self.run_gc(deadline)?;

        Ok(report)
    }

    fn run_gc(&self, deadline: &Deadline) -> Result<()> {
        match self.gc_mode {
            GcMode::Off => Ok(()),
            GcMode::Auto => self.run(&["gc", "--auto"], &[], deadline).map(|_| ()),
            GcMode::Always => self.run(&["gc"], &[], deadline).map(|_| ()),
            GcMode::Aggressive => self.run(&["gc", "--aggressive"], &[], deadline).map(|_| ()),
        }
    }
}

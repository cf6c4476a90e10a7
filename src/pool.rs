//! The Repo Pool: owns every [`Engine`] keyed by its normalised remote
//! URL, and is the only thing the Reconciler and the daemon's read-API
//! surface ever talk to directly.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use camino::Utf8Path;

use crate::cancel::{CancelToken, Deadline};
use crate::config::{RepositoryConfig, WorktreeConfig};
use crate::engine::{CloneOutcome, Engine, EngineDeps};
use crate::error::{Error, Result};
use crate::naming::tracker_name;
use crate::parse::CommitWithChangedFiles;

/// How long `Shutdown` polls for every engine's loop to exit before giving
/// up and returning anyway.
const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

/// All configured repositories' engines, keyed by normalised remote URL —
/// a repository is uniquely identified by its normalised remote.
pub struct Pool {
    engines: RwLock<HashMap<String, Arc<Engine>>>,
    cancel: CancelToken,
}

impl Pool {
    pub fn new() -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            cancel: CancelToken::new(),
        }
    }

    /// The token every engine's loop derives its deadlines from; cancelling
    /// it unblocks every in-flight `Mirror` cycle.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Builds and registers a new engine for `cfg`. Errors with
    /// [`Error::Exist`] if a repository with the same normalised remote is
    /// already present.
    pub fn add_repository(&self, cfg: &RepositoryConfig, deps: EngineDeps) -> Result<Arc<Engine>> {
        let engine = Arc::new(Engine::new(cfg, deps)?);
        let key = engine.normalised_remote().to_string();

        let mut engines = self.engines.write().unwrap();
        if engines.contains_key(&key) {
            return Err(Error::Exist(key));
        }
        engines.insert(key, engine.clone());
        Ok(engine)
    }

    /// Stops and drops the engine for `remote` (already normalised or not;
    /// normalisation happens via [`crate::url::parse`]), deletes every
    /// published worktree-link symlink (best-effort, errors logged), and
    /// recursively deletes the mirror directory.
    pub fn remove_repository(&self, normalised_remote: &str) -> Result<()> {
        let engine = {
            let mut engines = self.engines.write().unwrap();
            engines
                .remove(normalised_remote)
                .ok_or_else(|| Error::NotExist(normalised_remote.to_string()))?
        };
        if engine.is_running() {
            engine.stop_loop();
        }

        for link in engine.worktree_links() {
            if let Some(wt_dir) = &link.worktree_dir {
                if let Some((parent, name)) = wt_dir.parent().zip(wt_dir.file_name()) {
                    let tracker_path = parent.join(tracker_name(name));
                    if let Err(e) = std::fs::remove_file(tracker_path.as_str()) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            log::warn!("{normalised_remote}: could not remove tracker symlink {tracker_path}: {e}");
                        }
                    }
                }
            }
            if let Err(e) = std::fs::remove_file(link.link_abs.as_str()) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("{normalised_remote}: could not remove worktree link {}: {e}", link.link_abs);
                }
            }
        }

        if engine.mirror_dir().exists() {
            std::fs::remove_dir_all(engine.mirror_dir())
                .map_err(|e| Error::io(engine.mirror_dir().to_path_buf(), e))?;
        }

        Ok(())
    }

    pub fn repository(&self, normalised_remote: &str) -> Option<Arc<Engine>> {
        self.engines.read().unwrap().get(normalised_remote).cloned()
    }

    fn engine_or_not_exist(&self, remote: &str) -> Result<Arc<Engine>> {
        self.repository(remote)
            .ok_or_else(|| Error::NotExist(remote.to_string()))
    }

    pub fn repositories(&self) -> Vec<Arc<Engine>> {
        self.engines.read().unwrap().values().cloned().collect()
    }

    pub fn normalised_remotes(&self) -> Vec<String> {
        self.engines.read().unwrap().keys().cloned().collect()
    }

    /// Locates the engine for `remote`, validates that the new link's
    /// absolute path does not collide with any existing link across the
    /// whole pool, then delegates to the engine — all under one pool write
    /// lock, so two concurrent calls naming colliding paths on different
    /// engines can't both pass the check before either mutates.
    pub fn add_worktree_link(&self, remote: &str, wtc: WorktreeConfig) -> Result<()> {
        let engines = self.engines.write().unwrap();
        let engine = engines
            .get(remote)
            .ok_or_else(|| Error::NotExist(remote.to_string()))?;

        let candidate_abs = engine.link_absolute_path(&wtc.link);
        for other in engines.values() {
            if other
                .worktree_links()
                .iter()
                .any(|l| l.link_abs == candidate_abs)
            {
                return Err(Error::ValidationFailed(format!(
                    "worktree link path {candidate_abs} is already published by another repository"
                )));
            }
        }
        engine.add_worktree_link(wtc)
    }

    /// Per-remote facade over [`Engine::remove_worktree_link`], returning
    /// [`Error::NotExist`] if no matching engine is registered.
    pub fn remove_worktree_link(&self, remote: &str, link: &str) -> Result<()> {
        self.engine_or_not_exist(remote)?.remove_worktree_link(link)
    }

    /// Per-remote facade over [`Engine::mirror`].
    pub fn mirror(&self, remote: &str, deadline: &Deadline) -> Result<()> {
        self.engine_or_not_exist(remote)?.mirror(deadline)
    }

    /// Per-remote facade over [`Engine::queue_mirror_run`].
    pub fn queue_mirror_run(&self, remote: &str) -> Result<()> {
        self.engine_or_not_exist(remote)?.queue_mirror_run();
        Ok(())
    }

    /// Per-remote facade over [`Engine::hash`].
    pub fn hash(&self, remote: &str, reference: &str, deadline: &Deadline) -> Result<String> {
        self.engine_or_not_exist(remote)?.hash(reference, deadline)
    }

    /// Per-remote facade over [`Engine::subject`].
    pub fn subject(&self, remote: &str, reference: &str, deadline: &Deadline) -> Result<String> {
        self.engine_or_not_exist(remote)?.subject(reference, deadline)
    }

    /// Per-remote facade over [`Engine::changed_files`].
    pub fn changed_files(
        &self,
        remote: &str,
        reference: &str,
        deadline: &Deadline,
    ) -> Result<Vec<String>> {
        self.engine_or_not_exist(remote)?.changed_files(reference, deadline)
    }

    /// Per-remote facade over [`Engine::object_exists`].
    pub fn object_exists(&self, remote: &str, object: &str, deadline: &Deadline) -> Result<bool> {
        self.engine_or_not_exist(remote)?.object_exists(object, deadline)
    }

    /// Per-remote facade over [`Engine::clone_to`].
    #[allow(clippy::too_many_arguments)]
    pub fn clone_to(
        &self,
        remote: &str,
        dst: &Utf8Path,
        reference: &str,
        pathspecs: &[String],
        rm_git_dir: bool,
        deadline: &Deadline,
    ) -> Result<CloneOutcome> {
        self.engine_or_not_exist(remote)?
            .clone_to(dst, reference, pathspecs, rm_git_dir, deadline)
    }

    /// Per-remote facade over [`Engine::merge_commits`].
    pub fn merge_commits(
        &self,
        remote: &str,
        reference: &str,
        deadline: &Deadline,
    ) -> Result<Vec<String>> {
        self.engine_or_not_exist(remote)?.merge_commits(reference, deadline)
    }

    /// Per-remote facade over [`Engine::branch_commits`].
    pub fn branch_commits(
        &self,
        remote: &str,
        branch: &str,
        deadline: &Deadline,
    ) -> Result<Vec<String>> {
        self.engine_or_not_exist(remote)?.branch_commits(branch, deadline)
    }

    /// Per-remote facade over [`Engine::list_commits_with_changed_files`].
    pub fn list_commits_with_changed_files(
        &self,
        remote: &str,
        reference: &str,
        limit: Option<usize>,
        deadline: &Deadline,
    ) -> Result<Vec<CommitWithChangedFiles>> {
        self.engine_or_not_exist(remote)?
            .list_commits_with_changed_files(reference, limit, deadline)
    }

    /// Runs one synchronous `Mirror` cycle against every registered engine,
    /// each bounded by its own configured mirror timeout, returning the
    /// first error encountered while still attempting every engine. Used
    /// for `--one-time` runs and the initial pass before `StartLoop`.
    pub fn mirror_all(&self) -> Result<()> {
        let mut first_err = None;
        for engine in self.repositories() {
            let deadline = Deadline::with_cancel(self.cancel.clone())
                .with_timeout(engine.mirror_timeout);
            if let Err(e) = engine.mirror(&deadline) {
                log::error!("{}: initial mirror failed: {e}", engine.normalised_remote());
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Spawns one background thread per registered engine running its
    /// periodic loop, cancellable via `self.cancel_token()`; each
    /// repository's loop runs on its own thread.
    pub fn start_loop(self: &Arc<Self>) {
        for engine in self.repositories() {
            let cancel = self.cancel.clone();
            std::thread::Builder::new()
                .name(format!("mirror-loop[{}]", engine.normalised_remote()))
                .spawn(move || engine.start_loop(cancel))
                .expect("failed to spawn mirror loop thread");
        }
    }

    /// Cancels every engine's in-flight work and waits (polling) until none
    /// report `is_running`, then returns. Bounded by nothing: callers that
    /// need a hard deadline should race this against their own timer.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let engines = self.repositories();
        for engine in &engines {
            engine.stop_loop();
        }
        loop {
            if engines.iter().all(|e| !e.is_running()) {
                return;
            }
            std::thread::sleep(SHUTDOWN_POLL);
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn cfg(remote: &str) -> RepositoryConfig {
        RepositoryConfig {
            remote: remote.into(),
            root: Some(Utf8PathBuf::from("/tmp/git-mirror-pool-test")),
            ..Default::default()
        }
    }

    #[test]
    fn add_repository_rejects_duplicate_normalised_remote() {
        let pool = Pool::new();
        pool.add_repository(&cfg("https://github.com/acme/widgets.git"), EngineDeps::default())
            .unwrap();
        let err = pool
            .add_repository(&cfg("https://github.com/acme/widgets"), EngineDeps::default())
            .unwrap_err();
        assert!(matches!(err, Error::Exist(_)));
    }

    #[test]
    fn remove_repository_requires_existing_entry() {
        let pool = Pool::new();
        let err = pool.remove_repository("https://github.com/acme/widgets").unwrap_err();
        assert!(matches!(err, Error::NotExist(_)));
    }

    #[test]
    fn repository_lookup_round_trips() {
        let pool = Pool::new();
        let engine = pool
            .add_repository(&cfg("https://github.com/acme/widgets.git"), EngineDeps::default())
            .unwrap();
        let key = engine.normalised_remote().to_string();
        assert!(pool.repository(&key).is_some());
        pool.remove_repository(&key).unwrap();
        assert!(pool.repository(&key).is_none());
    }

    #[test]
    fn remove_repository_deletes_the_mirror_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let pool = Pool::new();
        let engine = pool
            .add_repository(
                &RepositoryConfig {
                    remote: "https://github.com/acme/widgets.git".into(),
                    root: Some(root),
                    ..Default::default()
                },
                EngineDeps::default(),
            )
            .unwrap();
        std::fs::create_dir_all(engine.mirror_dir()).unwrap();
        let key = engine.normalised_remote().to_string();

        pool.remove_repository(&key).unwrap();
        assert!(!engine.mirror_dir().exists());
    }

    #[test]
    fn add_worktree_link_rejects_path_collision_across_repositories() {
        let dir = tempfile::tempdir().unwrap();
        let link_root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let pool = Pool::new();
        let cfg_for = |remote: &str| RepositoryConfig {
            remote: remote.into(),
            root: Some(link_root.clone()),
            link_root: Some(link_root.clone()),
            ..Default::default()
        };
        let a = pool
            .add_repository(&cfg_for("https://github.com/acme/a.git"), EngineDeps::default())
            .unwrap();
        let b = pool
            .add_repository(&cfg_for("https://github.com/acme/b.git"), EngineDeps::default())
            .unwrap();

        pool.add_worktree_link(
            a.normalised_remote(),
            WorktreeConfig {
                link: "shared".into(),
                reference: "main".into(),
                pathspecs: vec![],
            },
        )
        .unwrap();

        let err = pool
            .add_worktree_link(
                b.normalised_remote(),
                WorktreeConfig {
                    link: "shared".into(),
                    reference: "main".into(),
                    pathspecs: vec![],
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
    }

    #[test]
    fn add_worktree_link_requires_existing_engine() {
        let pool = Pool::new();
        let err = pool
            .add_worktree_link(
                "nope",
                WorktreeConfig {
                    link: "l".into(),
                    reference: "main".into(),
                    pathspecs: vec![],
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotExist(_)));
    }
}

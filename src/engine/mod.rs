//! The Mirror Engine: owns one bare mirror directory and a set of named
//! worktree links.
//!
//! Split across submodules by concern: `init` (bare-repo lifecycle),
//! `fetch`, `worktree` (ensure + publish), `cleanup`, `read` (cooperative
//! read-lock operations), `clone_op` (one-shot `Clone`), and `loop_` (the
//! periodic scheduler).

mod cleanup;
mod clone_op;
mod fetch;
mod init;
mod loop_;
mod read;
mod worktree;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam::channel::{bounded, Receiver, Sender};

use crate::auth::{TokenCache, TokenMinter, UnconfiguredTokenMinter};
use crate::cancel::{CancelToken, Deadline};
use crate::config::{AuthConfig, GcMode, RepositoryConfig, WorktreeConfig};
use crate::error::{Error, Result};
use crate::metrics::{LoggingMetricsSink, MetricsSink};
use crate::subprocess::GitRunner;
use crate::url::{self, RemoteUrl};

/// A live worktree link: the desired configuration plus the computed
/// absolute link path and the current checkout directory.
#[derive(Debug, Clone)]
pub struct LiveWorktreeLink {
    pub desired: WorktreeConfig,
    pub link_abs: Utf8PathBuf,
    pub worktree_dir: Option<Utf8PathBuf>,
}

#[derive(Default)]
struct EngineState {
    links: HashMap<String, LiveWorktreeLink>,
}

pub struct EngineDeps {
    pub git_binary: Utf8PathBuf,
    pub base_env: Vec<(String, String)>,
    pub metrics: Arc<dyn MetricsSink>,
    pub token_minter: Arc<dyn TokenMinter>,
}

impl Default for EngineDeps {
    fn default() -> Self {
        Self {
            git_binary: Utf8PathBuf::from("git"),
            base_env: Vec::new(),
            metrics: Arc::new(LoggingMetricsSink),
            token_minter: Arc::new(UnconfiguredTokenMinter),
        }
    }
}

pub struct Engine {
    pub(crate) remote: RemoteUrl,
    pub(crate) normalised: String,
    pub(crate) root: Utf8PathBuf,
    pub(crate) link_root: Utf8PathBuf,
    pub(crate) mirror_dir: Utf8PathBuf,
    pub(crate) interval: Duration,
    pub(crate) mirror_timeout: Duration,
    pub(crate) gc_mode: GcMode,
    pub(crate) auth: AuthConfig,
    pub(crate) git: GitRunner,
    pub(crate) token_cache: TokenCache,
    pub(crate) token_minter: Arc<dyn TokenMinter>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    state: RwLock<EngineState>,
    running: AtomicBool,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    stopped_tx: Sender<()>,
    stopped_rx: Receiver<()>,
    queue_tx: Sender<()>,
    queue_rx: Receiver<()>,
}

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_MIRROR_TIMEOUT: Duration = Duration::from_secs(10 * 60);

impl Engine {
    pub fn new(cfg: &RepositoryConfig, deps: EngineDeps) -> Result<Self> {
        let remote = url::parse(&cfg.remote)?;
        let normalised = remote.normalised();

        let root = cfg
            .root
            .clone()
            .ok_or_else(|| Error::ValidationFailed("repository root is required".into()))?;
        let link_root = cfg.link_root.clone().unwrap_or_else(|| root.clone());

        let repo_name = remote
            .repo
            .strip_suffix(".git")
            .unwrap_or(&remote.repo)
            .to_string();
        let mirror_dir = root.join("repo-mirrors").join(format!("{repo_name}.git"));

        let interval = cfg
            .interval
            .map(Duration::from_secs)
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_INTERVAL);
        let mirror_timeout = cfg
            .mirror_timeout
            .map(Duration::from_secs)
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_MIRROR_TIMEOUT);

        let (stop_tx, stop_rx) = bounded(1);
        let (stopped_tx, stopped_rx) = bounded(0);
        let (queue_tx, queue_rx) = bounded(1);

        let mut state = EngineState::default();
        for wt in &cfg.worktrees {
            insert_link(&mut state, &link_root, wt.clone())?;
        }

        Ok(Self {
            remote,
            normalised,
            root,
            link_root,
            mirror_dir,
            interval,
            mirror_timeout,
            gc_mode: cfg.git_gc.unwrap_or_default(),
            auth: cfg.auth.clone(),
            git: GitRunner::new(deps.git_binary, deps.base_env),
            token_cache: TokenCache::new(),
            token_minter: deps.token_minter,
            metrics: deps.metrics,
            state: RwLock::new(state),
            running: AtomicBool::new(false),
            stop_tx,
            stop_rx,
            stopped_tx,
            stopped_rx,
            queue_tx,
            queue_rx,
        })
    }

    pub fn remote(&self) -> &RemoteUrl {
        &self.remote
    }

    pub fn normalised_remote(&self) -> &str {
        &self.normalised
    }

    pub fn mirror_dir(&self) -> &Utf8Path {
        &self.mirror_dir
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the live link map, cloned so callers never observe
    /// interior mutability.
    pub fn worktree_links(&self) -> Vec<LiveWorktreeLink> {
        self.state.read().unwrap().links.values().cloned().collect()
    }

    pub fn add_worktree_link(&self, wtc: WorktreeConfig) -> Result<()> {
        if wtc.link.trim().is_empty() {
            return Err(Error::ValidationFailed("link name must not be empty".into()));
        }
        let mut wtc = wtc;
        if wtc.reference.is_empty() {
            wtc.reference = "HEAD".to_string();
        }
        wtc.pathspecs.sort();

        let mut state = self.state.write().unwrap();
        if state.links.contains_key(&wtc.link) {
            return Err(Error::Exist(wtc.link));
        }
        insert_link(&mut state, &self.link_root, wtc)
    }

    /// Deletes only from the desired map; physical cleanup happens in the
    /// next `Mirror` cycle.
    pub fn remove_worktree_link(&self, link: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state
            .links
            .remove(link)
            .map(|_| ())
            .ok_or_else(|| Error::NotExist(link.to_string()))
    }

    pub(crate) fn link_absolute_path(&self, link: &str) -> Utf8PathBuf {
        let p = Utf8Path::new(link);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.link_root.join(p)
        }
    }

    fn env_for_remote(&self) -> Result<Vec<(String, String)>> {
        let repo_full_name = format!(
            "{}/{}",
            self.remote.path.trim_start_matches('/'),
            self.remote.repo.strip_suffix(".git").unwrap_or(&self.remote.repo),
        );
        crate::auth::env_for(
            &self.auth,
            self.remote.scheme,
            self.remote.host.as_deref(),
            &repo_full_name,
            &self.mirror_dir,
            &self.token_cache,
            self.token_minter.as_ref(),
        )
    }

    pub fn stopped_channel(&self) -> Receiver<()> {
        self.stopped_rx.clone()
    }
}

fn insert_link(
    state: &mut EngineState,
    link_root: &Utf8Path,
    wtc: WorktreeConfig,
) -> Result<()> {
    let p = Utf8Path::new(&wtc.link);
    let link_abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        link_root.join(p)
    };
    state.links.insert(
        wtc.link.clone(),
        LiveWorktreeLink {
            desired: wtc,
            link_abs,
            worktree_dir: None,
        },
    );
    Ok(())
}

pub(crate) fn acquire_read<'a>(
    lock: &'a RwLock<EngineState>,
    deadline: &Deadline,
) -> Result<std::sync::RwLockReadGuard<'a, EngineState>> {
    const POLL: Duration = Duration::from_secs(1);
    loop {
        if let Ok(guard) = lock.try_read() {
            return Ok(guard);
        }
        if deadline.is_expired() {
            return Err(Error::Cancelled);
        }
        let wait = deadline.remaining().map(|r| r.min(POLL)).unwrap_or(POLL);
        std::thread::sleep(wait);
        if deadline.is_expired() {
            return Err(Error::Cancelled);
        }
    }
}

pub use cleanup::CleanupReport;
pub use clone_op::CloneOutcome;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;

    fn base_cfg() -> RepositoryConfig {
        RepositoryConfig {
            remote: "https://github.com/acme/widgets.git".into(),
            root: Some(Utf8PathBuf::from("/tmp/git-mirror-test-root")),
            ..Default::default()
        }
    }

    #[test]
    fn new_computes_mirror_dir_under_repo_mirrors() {
        let engine = Engine::new(&base_cfg(), EngineDeps::default()).unwrap();
        assert_eq!(
            engine.mirror_dir(),
            Utf8Path::new("/tmp/git-mirror-test-root/repo-mirrors/widgets.git")
        );
    }

    #[test]
    fn add_worktree_link_rejects_duplicate_name() {
        let engine = Engine::new(&base_cfg(), EngineDeps::default()).unwrap();
        engine
            .add_worktree_link(WorktreeConfig {
                link: "l1".into(),
                reference: "main".into(),
                pathspecs: vec![],
            })
            .unwrap();
        let err = engine
            .add_worktree_link(WorktreeConfig {
                link: "l1".into(),
                reference: "dev".into(),
                pathspecs: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, Error::Exist(_)));
    }

    #[test]
    fn add_worktree_link_defaults_ref_and_sorts_pathspecs() {
        let engine = Engine::new(&base_cfg(), EngineDeps::default()).unwrap();
        engine
            .add_worktree_link(WorktreeConfig {
                link: "l1".into(),
                reference: String::new(),
                pathspecs: vec!["b".into(), "a".into()],
            })
            .unwrap();
        let links = engine.worktree_links();
        assert_eq!(links[0].desired.reference, "HEAD");
        assert_eq!(links[0].desired.pathspecs, vec!["a", "b"]);
    }

    #[test]
    fn remove_worktree_link_is_desired_map_only() {
        let engine = Engine::new(&base_cfg(), EngineDeps::default()).unwrap();
        engine
            .add_worktree_link(WorktreeConfig {
                link: "l1".into(),
                reference: "main".into(),
                pathspecs: vec![],
            })
            .unwrap();
        engine.remove_worktree_link("l1").unwrap();
        assert!(engine.worktree_links().is_empty());
        assert!(matches!(
            engine.remove_worktree_link("l1").unwrap_err(),
            Error::NotExist(_)
        ));
    }
}

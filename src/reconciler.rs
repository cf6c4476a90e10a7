//! The Reconciler: turns a freshly-loaded [`Config`] document into pool
//! mutations, diffing against what's already registered.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{self, Config, RepositoryConfig, WorktreeConfig};
use crate::engine::{Engine, EngineDeps};
use crate::error::Result;
use crate::pool::Pool;
use crate::url;

/// One pass of loading + validating + diffing a document against `pool`.
pub struct Reconciler {
    deps_factory: Box<dyn Fn() -> EngineDeps + Send + Sync>,
}

impl Reconciler {
    /// `deps_factory` is called once per newly-added repository to build
    /// that engine's [`EngineDeps`] (metrics sink, token minter, git
    /// binary); the same factory is reused across reconciliation passes so
    /// callers can close over shared `Arc<dyn MetricsSink>`/`Arc<dyn
    /// TokenMinter>` instances.
    pub fn new(deps_factory: impl Fn() -> EngineDeps + Send + Sync + 'static) -> Self {
        Self {
            deps_factory: Box::new(deps_factory),
        }
    }

    /// Parses, defaults, and validates `text` as a configuration document,
    /// without touching the pool. Split out from [`Self::reconcile`] so
    /// callers can reject a bad reload before tearing anything down: a
    /// config reload that fails validation leaves the running daemon
    /// untouched.
    pub fn prepare(&self, text: &str) -> Result<Config> {
        let parsed = config::parse_yaml(text)?;
        let mut defaulted = config::apply_defaults(&parsed);
        for repo in &mut defaulted.repositories {
            config::populate_empty_link_paths(repo)?;
        }
        config::validate(&defaulted)?;
        config::validate_link_paths(&defaulted)?;
        Ok(defaulted)
    }

    /// Applies `config` (already returned by [`Self::prepare`]) to `pool`:
    /// removes repositories no longer present, adds new ones, and rebinds
    /// changed worktree links on existing ones. Per repository, a worktree
    /// diff removes before it adds so two links can swap names without a
    /// path collision window.
    pub fn reconcile(&self, pool: &Arc<Pool>, config: &Config) -> Result<()> {
        let desired: HashMap<String, &RepositoryConfig> = config
            .repositories
            .iter()
            .map(|r| Ok((url::parse(&r.remote)?.normalised(), r)))
            .collect::<Result<_>>()?;

        for existing in pool.normalised_remotes() {
            if !desired.contains_key(&existing) {
                log::info!("{existing}: repository removed from configuration");
                pool.remove_repository(&existing)?;
            }
        }

        for (normalised, repo_cfg) in &desired {
            match pool.repository(normalised) {
                Some(engine) => self.diff_worktrees(pool, &engine, repo_cfg)?,
                None => {
                    log::info!("{normalised}: repository added to configuration");
                    pool.add_repository(repo_cfg, (self.deps_factory)())?;
                }
            }
        }
        Ok(())
    }

    /// Per-repository worktree-link diff: desired links absent from the
    /// live set are added, live links absent from (or changed relative to)
    /// the desired set are removed, in that remove-then-add order. Goes
    /// through `pool` rather than `engine` directly so link additions run
    /// under the pool-wide path-uniqueness check.
    fn diff_worktrees(&self, pool: &Pool, engine: &Engine, repo_cfg: &RepositoryConfig) -> Result<()> {
        let live = engine.worktree_links();
        let live_by_name: HashMap<&str, &WorktreeConfig> =
            live.iter().map(|l| (l.desired.link.as_str(), &l.desired)).collect();
        let desired_by_name: HashMap<&str, &WorktreeConfig> =
            repo_cfg.worktrees.iter().map(|w| (w.link.as_str(), w)).collect();
        let remote = engine.normalised_remote();

        for (name, live_wtc) in &live_by_name {
            match desired_by_name.get(name) {
                Some(desired_wtc) if live_wtc.same_desired_state(desired_wtc) => {}
                _ => {
                    pool.remove_worktree_link(remote, name)?;
                }
            }
        }
        for (name, desired_wtc) in &desired_by_name {
            let unchanged = live_by_name
                .get(name)
                .is_some_and(|live_wtc| live_wtc.same_desired_state(desired_wtc));
            if !unchanged {
                pool.add_worktree_link(remote, (*desired_wtc).clone())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<Pool> {
        Arc::new(Pool::new())
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(EngineDeps::default)
    }

    fn doc(root: &str, remotes: &[&str]) -> String {
        let repos: String = remotes
            .iter()
            .map(|r| format!("  - remote: {r}\n"))
            .collect();
        format!("defaults:\n  root: {root}\nrepositories:\n{repos}")
    }

    #[test]
    fn reconcile_adds_and_removes_repositories() {
        let p = pool();
        let r = reconciler();

        let cfg = r
            .prepare(&doc(
                "/tmp/git-mirror-reconciler-test",
                &["https://github.com/acme/a.git", "https://github.com/acme/b.git"],
            ))
            .unwrap();
        r.reconcile(&p, &cfg).unwrap();
        assert_eq!(p.repositories().len(), 2);

        let cfg2 = r
            .prepare(&doc(
                "/tmp/git-mirror-reconciler-test",
                &["https://github.com/acme/b.git"],
            ))
            .unwrap();
        r.reconcile(&p, &cfg2).unwrap();
        let remaining = p.repositories();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].normalised_remote().ends_with("acme/b"));
    }

    #[test]
    fn reconcile_rebinds_changed_worktree_links() {
        let p = pool();
        let r = reconciler();

        let yaml1 = "defaults:\n  root: /tmp/git-mirror-reconciler-test2\nrepositories:\n  - remote: https://github.com/acme/a.git\n    worktrees:\n      - link: main\n        ref: main\n";
        let cfg1 = r.prepare(yaml1).unwrap();
        r.reconcile(&p, &cfg1).unwrap();
        let engine = p.repository(&url::parse("https://github.com/acme/a.git").unwrap().normalised()).unwrap();
        assert_eq!(engine.worktree_links()[0].desired.reference, "main");

        let yaml2 = "defaults:\n  root: /tmp/git-mirror-reconciler-test2\nrepositories:\n  - remote: https://github.com/acme/a.git\n    worktrees:\n      - link: main\n        ref: dev\n";
        let cfg2 = r.prepare(yaml2).unwrap();
        r.reconcile(&p, &cfg2).unwrap();
        assert_eq!(engine.worktree_links()[0].desired.reference, "dev");
    }

    #[test]
    fn prepare_rejects_colliding_link_paths() {
        let r = reconciler();
        let yaml = "defaults:\n  root: /tmp/git-mirror-reconciler-test3\nrepositories:\n  - remote: https://github.com/acme/a.git\n    worktrees:\n      - link: shared\n        ref: main\n  - remote: https://github.com/acme/b.git\n    worktrees:\n      - link: shared\n        ref: main\n";
        assert!(r.prepare(yaml).is_err());
    }

    #[test]
    fn prepare_is_side_effect_free_on_invalid_document() {
        let p = pool();
        let r = reconciler();
        let bad = "repositories:\n  - remote: x\n    bogus_field: 1\n";
        assert!(r.prepare(bad).is_err());
        assert!(p.repositories().is_empty());
    }
}

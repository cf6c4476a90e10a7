//! Create-or-sanity-check the bare mirror directory, with a
//! wipe-and-reinitialise fallback when the sanity check fails.

use camino::Utf8Path;

use crate::cancel::Deadline;
use crate::error::{Error, Result};

use super::Engine;

impl Engine {
    pub(crate) fn ensure_initialised(&self, deadline: &Deadline) -> Result<()> {
        if !self.mirror_dir.exists() {
            return self.initialise(deadline);
        }

        match self.sanity_check(deadline) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!(
                    "{}: mirror failed sanity check ({e}), wiping and reinitialising",
                    self.normalised
                );
                std::fs::remove_dir_all(&self.mirror_dir)
                    .map_err(|e| Error::io(self.mirror_dir.clone(), e))?;
                self.initialise(deadline)
            }
        }
    }

    fn initialise(&self, deadline: &Deadline) -> Result<()> {
        log::debug!("{}: initialising bare mirror at {}", self.normalised, self.mirror_dir);
        std::fs::create_dir_all(&self.mirror_dir)
            .map_err(|e| Error::io(self.mirror_dir.clone(), e))?;

        let env = self.env_for_remote()?;
        self.as_mirror_failed(self.run(&["init", "--bare"], &env, deadline))?;
        self.as_mirror_failed(self.run(
            &["remote", "add", "origin", self.remote.to_string().as_str()],
            &env,
            deadline,
        ))?;
        self.as_mirror_failed(self.run(
            &[
                "config",
                "remote.origin.fetch",
                "+refs/*:refs/*",
            ],
            &env,
            deadline,
        ))?;

        if let Some(default_branch) = self.discover_default_branch(&env, deadline)? {
            self.as_mirror_failed(self.run(
                &["symbolic-ref", "HEAD", &format!("refs/heads/{default_branch}")],
                &env,
                deadline,
            ))?;
        }
        Ok(())
    }

    /// Recasts a generic subprocess failure as `MirrorFailed`: callers of
    /// `initialise`/`sanity_check` rely on that kind meaning the mirror
    /// directory may be wiped and reinitialised next cycle.
    fn as_mirror_failed<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|e| match e {
            Error::CommandFailed { reason, .. } => Error::MirrorFailed {
                remote: self.normalised.clone(),
                reason,
            },
            other => other,
        })
    }

    fn discover_default_branch(
        &self,
        env: &[(String, String)],
        deadline: &Deadline,
    ) -> Result<Option<String>> {
        let out = self.as_mirror_failed(self.run(
            &["ls-remote", "--symref", "origin", "HEAD"],
            env,
            deadline,
        ))?;
        for line in out.lines() {
            if let Some(rest) = line.strip_prefix("ref: ") {
                if let Some((reference, _head)) = rest.split_once('\t') {
                    if let Some(branch) = reference.strip_prefix("refs/heads/") {
                        return Ok(Some(branch.to_string()));
                    }
                }
            }
        }
        Ok(None)
    }

    fn sanity_check(&self, deadline: &Deadline) -> Result<()> {
        let env = self.env_for_remote()?;

        let is_bare = self
            .as_mirror_failed(self.run(&["rev-parse", "--is-bare-repository"], &env, deadline))?
            .trim()
            == "true";
        if !is_bare {
            return Err(Error::MirrorFailed {
                remote: self.normalised.clone(),
                reason: "mirror directory is not a bare repository".into(),
            });
        }

        let origin_url = self
            .as_mirror_failed(self.run(&["config", "--get", "remote.origin.url"], &env, deadline))?
            .trim()
            .to_string();
        let parsed_origin = crate::url::parse(&origin_url)?;
        if parsed_origin != self.remote {
            return Err(Error::MirrorFailed {
                remote: self.normalised.clone(),
                reason: format!("origin url {origin_url:?} no longer matches configured remote"),
            });
        }

        let fetch_refspec = self
            .as_mirror_failed(self.run(
                &["config", "--get", "remote.origin.fetch"],
                &env,
                deadline,
            ))?
            .trim()
            .to_string();
        if fetch_refspec != "+refs/*:refs/*" {
            return Err(Error::MirrorFailed {
                remote: self.normalised.clone(),
                reason: format!("unexpected fetch refspec {fetch_refspec:?}"),
            });
        }

        self.as_mirror_failed(self.run(
            &["fsck", "--connectivity-only"],
            &env,
            deadline,
        ))?;

        Ok(())
    }

    pub(crate) fn run(
        &self,
        args: &[&str],
        env: &[(String, String)],
        deadline: &Deadline,
    ) -> Result<String> {
        self.git.run(self.mirror_dir.as_path(), args, env, deadline)
    }

    pub(crate) fn run_in(
        &self,
        cwd: &Utf8Path,
        args: &[&str],
        env: &[(String, String)],
        deadline: &Deadline,
    ) -> Result<String> {
        self.git.run(cwd, args, env, deadline)
    }
}

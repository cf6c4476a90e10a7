//! `Clone`: a one-shot single-revision working tree checked out from the
//! bare mirror via `--shared`.

use camino::{Utf8Path, Utf8PathBuf};

use crate::cancel::Deadline;
use crate::error::{Error, Result};

use super::{acquire_read, Engine};

#[derive(Debug, Clone)]
pub struct CloneOutcome {
    pub head_commit: String,
}

impl Engine {
    pub fn clone_to(
        &self,
        dst: &Utf8Path,
        reference: &str,
        pathspecs: &[String],
        rm_git_dir: bool,
        deadline: &Deadline,
    ) -> Result<CloneOutcome> {
        let _guard = acquire_read(&self.state, deadline)?;

        let dst_abs = if dst.is_absolute() {
            dst.to_path_buf()
        } else {
            std::env::current_dir()
                .ok()
                .and_then(|p| Utf8PathBuf::try_from(p).ok())
                .unwrap_or_else(|| Utf8PathBuf::from("."))
                .join(dst)
        };

        if dst_abs.is_dir() {
            for entry in std::fs::read_dir(dst_abs.as_str())
                .map_err(|e| Error::io(dst_abs.clone(), e))?
            {
                let entry = entry.map_err(|e| Error::io(dst_abs.clone(), e))?;
                let path = entry.path();
                if path.is_dir() {
                    std::fs::remove_dir_all(&path).map_err(|e| Error::io(dst_abs.clone(), e))?;
                } else {
                    std::fs::remove_file(&path).map_err(|e| Error::io(dst_abs.clone(), e))?;
                }
            }
        } else {
            std::fs::create_dir_all(dst_abs.as_str()).map_err(|e| Error::io(dst_abs.clone(), e))?;
        }

        let hash = self.resolve_ref(reference, deadline)?;

        self.run(
            &[
                "clone",
                "--no-checkout",
                "--shared",
                self.mirror_dir.as_str(),
                dst_abs.as_str(),
            ],
            &[],
            deadline,
        )?;

        let mut checkout_args = vec!["checkout", hash.as_str()];
        if !pathspecs.is_empty() {
            checkout_args.push("--");
            for p in pathspecs {
                checkout_args.push(p.as_str());
            }
        }
        self.run_in(&dst_abs, &checkout_args, &[], deadline)?;

        let head = self
            .run_in(&dst_abs, &["rev-parse", "HEAD"], &[], deadline)?
            .trim()
            .to_string();

        if rm_git_dir {
            let git_dir = dst_abs.join(".git");
            if git_dir.exists() {
                std::fs::remove_dir_all(git_dir.as_str()).map_err(|e| Error::io(git_dir, e))?;
            }
        }

        Ok(CloneOutcome { head_commit: head })
    }
}

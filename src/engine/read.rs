//! Read-only queries against the bare mirror: acquire a cooperative read
//! lock, then run a single subprocess call.

use crate::cancel::Deadline;
use crate::error::Result;
use crate::parse::{parse_commits_with_changed_files, CommitWithChangedFiles};

use super::{acquire_read, Engine};

impl Engine {
    pub fn hash(&self, reference: &str, deadline: &Deadline) -> Result<String> {
        let _guard = acquire_read(&self.state, deadline)?;
        Ok(self
            .run(
                &["rev-parse", "--verify", &format!("{reference}^{{commit}}")],
                &[],
                deadline,
            )?
            .trim()
            .to_string())
    }

    pub fn subject(&self, reference: &str, deadline: &Deadline) -> Result<String> {
        let _guard = acquire_read(&self.state, deadline)?;
        Ok(self
            .run(&["log", "-1", "--format=%s", reference], &[], deadline)?
            .trim_end()
            .to_string())
    }

    pub fn changed_files(&self, reference: &str, deadline: &Deadline) -> Result<Vec<String>> {
        let _guard = acquire_read(&self.state, deadline)?;
        let out = self.run(
            &[
                "diff-tree",
                "--no-commit-id",
                "--name-only",
                "-r",
                reference,
            ],
            &[],
            deadline,
        )?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub fn object_exists(&self, object: &str, deadline: &Deadline) -> Result<bool> {
        let _guard = acquire_read(&self.state, deadline)?;
        Ok(self
            .run(&["cat-file", "-e", object], &[], deadline)
            .is_ok())
    }

    pub fn merge_commits(&self, reference: &str, deadline: &Deadline) -> Result<Vec<String>> {
        let _guard = acquire_read(&self.state, deadline)?;
        let out = self.run(
            &["log", "--merges", "--format=%H", reference],
            &[],
            deadline,
        )?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub fn branch_commits(&self, branch: &str, deadline: &Deadline) -> Result<Vec<String>> {
        let _guard = acquire_read(&self.state, deadline)?;
        let out = self.run(&["log", "--format=%H", branch], &[], deadline)?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub fn list_commits_with_changed_files(
        &self,
        reference: &str,
        limit: Option<usize>,
        deadline: &Deadline,
    ) -> Result<Vec<CommitWithChangedFiles>> {
        let _guard = acquire_read(&self.state, deadline)?;
        let mut args = vec!["log", "--name-only", "--format=%H", reference];
        let limit_arg;
        if let Some(n) = limit {
            limit_arg = format!("-{n}");
            args.insert(1, &limit_arg);
        }
        let out = self.run(&args, &[], deadline)?;
        Ok(parse_commits_with_changed_files(&out))
    }
}

//! The configuration document: a YAML file with a `defaults` block and a
//! list of `repositories`, each with `worktrees`.
//!
//! Deserialisation rejects unknown keys at every level via
//! `#[serde(deny_unknown_fields)]`, in the spirit of the strict config
//! structs in the `headlamp_core` pack member.

use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GcMode {
    #[default]
    Auto,
    Always,
    Aggressive,
    Off,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_key_path: Option<Utf8PathBuf>,
    pub ssh_known_hosts_path: Option<Utf8PathBuf>,
    pub github_app_id: Option<String>,
    pub github_app_installation_id: Option<String>,
    pub github_app_private_key_path: Option<Utf8PathBuf>,
}

impl AuthConfig {
    fn is_empty(&self) -> bool {
        self == &AuthConfig::default()
    }

    fn merge_defaults(&self, defaults: &AuthConfig) -> AuthConfig {
        if !self.is_empty() {
            return self.clone();
        }
        defaults.clone()
    }

    pub fn github_app(&self) -> Option<GithubAppAuth> {
        match (
            &self.github_app_id,
            &self.github_app_installation_id,
            &self.github_app_private_key_path,
        ) {
            (Some(app_id), Some(installation_id), Some(key_path)) => Some(GithubAppAuth {
                app_id: app_id.clone(),
                installation_id: installation_id.clone(),
                private_key_path: key_path.clone(),
            }),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        let any_app_field = self.github_app_id.is_some()
            || self.github_app_installation_id.is_some()
            || self.github_app_private_key_path.is_some();
        let all_app_fields = self.github_app().is_some();
        if any_app_field && !all_app_fields {
            return Err(Error::ValidationFailed(
                "github_app_id, github_app_installation_id and github_app_private_key_path must be set together".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubAppAuth {
    pub app_id: String,
    pub installation_id: String,
    pub private_key_path: Utf8PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorktreeConfig {
    pub link: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub pathspecs: Vec<String>,
}

impl WorktreeConfig {
    /// Equality used by the reconciler: link name, ref, and the *sorted*
    /// pathspec set (order-independent).
    pub fn same_desired_state(&self, other: &WorktreeConfig) -> bool {
        if self.link != other.link || self.reference != other.reference {
            return false;
        }
        let mut a = self.pathspecs.clone();
        let mut b = other.pathspecs.clone();
        a.sort();
        b.sort();
        a == b
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RepositoryConfig {
    pub remote: String,
    pub root: Option<Utf8PathBuf>,
    pub link_root: Option<Utf8PathBuf>,
    pub interval: Option<DurationSeconds>,
    pub mirror_timeout: Option<DurationSeconds>,
    pub git_gc: Option<GcMode>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub worktrees: Vec<WorktreeConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Defaults {
    pub root: Option<Utf8PathBuf>,
    pub link_root: Option<Utf8PathBuf>,
    pub interval: Option<DurationSeconds>,
    pub mirror_timeout: Option<DurationSeconds>,
    pub git_gc: Option<GcMode>,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

/// A plain integer number-of-seconds in the document, converted to a
/// `Duration` at the boundary.
pub type DurationSeconds = u64;

pub const MIN_DURATION: Duration = Duration::from_secs(1);

pub fn parse_yaml(text: &str) -> Result<Config> {
    serde_yaml::from_str(text)
        .map_err(|e| Error::ValidationFailed(format!("invalid configuration document: {e}")))
}

/// Propagates `defaults` into every repository entry that leaves a field
/// unset. `defaults.link_root` falling back to `defaults.root` happens
/// here too.
pub fn apply_defaults(config: &Config) -> Config {
    let defaults = &config.defaults;
    let effective_link_root = defaults
        .link_root
        .clone()
        .or_else(|| defaults.root.clone());

    let repositories = config
        .repositories
        .iter()
        .map(|repo| RepositoryConfig {
            remote: repo.remote.clone(),
            root: repo.root.clone().or_else(|| defaults.root.clone()),
            link_root: repo
                .link_root
                .clone()
                .or_else(|| effective_link_root.clone()),
            interval: repo.interval.or(defaults.interval),
            mirror_timeout: repo.mirror_timeout.or(defaults.mirror_timeout),
            git_gc: repo.git_gc.or(defaults.git_gc),
            auth: repo.auth.merge_defaults(&defaults.auth),
            worktrees: repo.worktrees.clone(),
        })
        .collect();

    Config {
        defaults: config.defaults.clone(),
        repositories,
    }
}

/// Structural/semantic validation: absolute paths, minimum durations,
/// all-or-none GitHub-app fields.
pub fn validate(config: &Config) -> Result<()> {
    validate_abs(config.defaults.root.as_ref(), "defaults.root")?;
    validate_abs(config.defaults.link_root.as_ref(), "defaults.link_root")?;
    validate_duration(config.defaults.interval, "defaults.interval")?;
    validate_duration(
        config.defaults.mirror_timeout,
        "defaults.mirror_timeout",
    )?;
    config.defaults.auth.validate()?;

    for repo in &config.repositories {
        if repo.remote.trim().is_empty() {
            return Err(Error::ValidationFailed(
                "repository entry missing 'remote'".into(),
            ));
        }
        validate_abs(repo.root.as_ref(), &format!("{}.root", repo.remote))?;
        validate_abs(
            repo.link_root.as_ref(),
            &format!("{}.link_root", repo.remote),
        )?;
        validate_duration(repo.interval, &format!("{}.interval", repo.remote))?;
        validate_duration(
            repo.mirror_timeout,
            &format!("{}.mirror_timeout", repo.remote),
        )?;
        repo.auth.validate()?;
    }
    Ok(())
}

fn validate_abs(path: Option<&Utf8PathBuf>, field: &str) -> Result<()> {
    if let Some(p) = path {
        if !p.is_absolute() {
            return Err(Error::ValidationFailed(format!(
                "{field} must be an absolute path, got {p:?}"
            )));
        }
    }
    Ok(())
}

fn validate_duration(seconds: Option<DurationSeconds>, field: &str) -> Result<()> {
    if let Some(s) = seconds {
        if s != 0 && Duration::from_secs(s) < MIN_DURATION {
            return Err(Error::ValidationFailed(format!(
                "{field} must be >= 1s if non-zero, got {s}s"
            )));
        }
    }
    Ok(())
}

/// Replaces any of ``\ : / * ? " < > | `` or whitespace with `_` and
/// collapses runs of `_`. Used both for synthesising link names from refs
/// and for validating the result isn't degenerate.
pub fn normalise_ref_for_link(reference: &str) -> Result<String> {
    let mut out = String::with_capacity(reference.len());
    let mut last_was_underscore = false;
    for c in reference.chars() {
        let replaced = matches!(c, '\\' | ':' | '/' | '*' | '?' | '"' | '<' | '>' | '|')
            || c.is_whitespace();
        if replaced {
            if !last_was_underscore {
                out.push('_');
                last_was_underscore = true;
            }
        } else {
            out.push(c);
            last_was_underscore = false;
        }
    }
    if out == "_" || out == "." || out == ".." {
        return Err(Error::ValidationFailed(format!(
            "ref {reference:?} normalises to a degenerate link name {out:?}"
        )));
    }
    Ok(out)
}

/// For every worktree entry with an empty `link`, default `ref` to `HEAD`
/// and synthesise `link` as `<repo-name-sans-.git>/<normalised-ref>` (or
/// the 7-char commit prefix, if `ref` is a full hash).
pub fn populate_empty_link_paths(repo: &mut RepositoryConfig) -> Result<()> {
    let remote = crate::url::parse(&repo.remote)?;
    let repo_name = remote.repo.strip_suffix(".git").unwrap_or(&remote.repo).to_string();

    if repo.worktrees.is_empty() {
        repo.worktrees.push(WorktreeConfig {
            link: String::new(),
            reference: String::new(),
            pathspecs: Vec::new(),
        });
    }

    for wt in &mut repo.worktrees {
        if wt.reference.is_empty() {
            wt.reference = "HEAD".to_string();
        }
        if wt.link.is_empty() {
            let suffix = if is_full_hash(&wt.reference) {
                wt.reference[..7].to_string()
            } else {
                normalise_ref_for_link(&wt.reference)?
            };
            wt.link = format!("{repo_name}/{suffix}");
        }
    }
    Ok(())
}

fn is_full_hash(s: &str) -> bool {
    (s.len() == 40 || s.len() == 64) && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Absolute path a worktree link publishes to: `link` as-is if already
/// absolute, else resolved under the repository's `link_root`.
pub fn link_absolute(link_root: &Utf8PathBuf, link: &str) -> Utf8PathBuf {
    let p = camino::Utf8Path::new(link);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        link_root.join(p)
    }
}

/// Global invariant: no two worktree links across the whole document may
/// publish to the same absolute path, since two engines atomically
/// re-publishing the same symlink would race each other forever. Must run
/// after `apply_defaults` + `populate_empty_link_paths`.
pub fn validate_link_paths(config: &Config) -> Result<()> {
    let mut seen = std::collections::HashMap::new();
    for repo in &config.repositories {
        let link_root = repo
            .link_root
            .clone()
            .or_else(|| repo.root.clone())
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        for wt in &repo.worktrees {
            let abs = link_absolute(&link_root, &wt.link);
            if let Some(prev_remote) = seen.insert(abs.clone(), repo.remote.clone()) {
                return Err(Error::ValidationFailed(format!(
                    "worktree link path {abs:?} is claimed by both {prev_remote:?} and {:?}",
                    repo.remote
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_defaults_to_repositories() {
        let yaml = r#"
defaults:
  root: /var/repo-mirrors
  interval: 60
repositories:
  - remote: https://github.com/acme/widgets.git
"#;
        let cfg = parse_yaml(yaml).unwrap();
        let cfg = apply_defaults(&cfg);
        assert_eq!(
            cfg.repositories[0].root,
            Some(Utf8PathBuf::from("/var/repo-mirrors"))
        );
        assert_eq!(cfg.repositories[0].interval, Some(60));
    }

    #[test]
    fn link_root_falls_back_to_root() {
        let yaml = r#"
defaults:
  root: /var/repo-mirrors
repositories:
  - remote: https://github.com/acme/widgets.git
"#;
        let cfg = apply_defaults(&parse_yaml(yaml).unwrap());
        assert_eq!(
            cfg.repositories[0].link_root,
            Some(Utf8PathBuf::from("/var/repo-mirrors"))
        );
    }

    #[test]
    fn rejects_unknown_keys() {
        let yaml = "repositories:\n  - remote: x\n    bogus: 1\n";
        assert!(parse_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_relative_root() {
        let yaml = "defaults:\n  root: relative/path\n";
        let cfg = parse_yaml(yaml).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_sub_second_interval() {
        let yaml = "defaults:\n  interval: 0\nrepositories: []\n";
        let cfg = parse_yaml(yaml).unwrap();
        assert!(validate(&cfg).is_ok());
        let yaml2 = "repositories:\n  - remote: x\n    interval: 1\n";
        assert!(validate(&parse_yaml(yaml2).unwrap()).is_ok());
    }

    #[test]
    fn github_app_fields_are_all_or_none() {
        let mut auth = AuthConfig {
            github_app_id: Some("1".into()),
            ..Default::default()
        };
        assert!(auth.validate().is_err());
        auth.github_app_installation_id = Some("2".into());
        auth.github_app_private_key_path = Some("/k".into());
        assert!(auth.validate().is_ok());
    }

    #[test]
    fn normalises_ref_for_link() {
        assert_eq!(
            normalise_ref_for_link("feature/foo bar").unwrap(),
            "feature_foo_bar"
        );
        assert!(normalise_ref_for_link("///").is_err());
    }

    #[test]
    fn populate_empty_link_uses_repo_name_and_ref() {
        let mut repo = RepositoryConfig {
            remote: "https://github.com/acme/widgets.git".into(),
            worktrees: vec![WorktreeConfig {
                link: String::new(),
                reference: "main".into(),
                pathspecs: vec![],
            }],
            ..Default::default()
        };
        populate_empty_link_paths(&mut repo).unwrap();
        assert_eq!(repo.worktrees[0].link, "widgets/main");
    }

    #[test]
    fn populate_empty_link_defaults_to_head_with_no_worktrees() {
        let mut repo = RepositoryConfig {
            remote: "https://github.com/acme/widgets.git".into(),
            ..Default::default()
        };
        populate_empty_link_paths(&mut repo).unwrap();
        assert_eq!(repo.worktrees.len(), 1);
        assert_eq!(repo.worktrees[0].reference, "HEAD");
        assert_eq!(repo.worktrees[0].link, "widgets/HEAD");
    }

    #[test]
    fn populate_empty_link_uses_commit_prefix() {
        let mut repo = RepositoryConfig {
            remote: "https://github.com/acme/widgets.git".into(),
            worktrees: vec![WorktreeConfig {
                link: String::new(),
                reference: "a".repeat(40),
                pathspecs: vec![],
            }],
            ..Default::default()
        };
        populate_empty_link_paths(&mut repo).unwrap();
        assert_eq!(repo.worktrees[0].link, format!("widgets/{}", "a".repeat(7)));
    }

    #[test]
    fn validate_link_paths_rejects_collisions_across_repositories() {
        let cfg = Config {
            defaults: Defaults::default(),
            repositories: vec![
                RepositoryConfig {
                    remote: "https://github.com/acme/a.git".into(),
                    link_root: Some(Utf8PathBuf::from("/links")),
                    worktrees: vec![WorktreeConfig {
                        link: "shared".into(),
                        reference: "main".into(),
                        pathspecs: vec![],
                    }],
                    ..Default::default()
                },
                RepositoryConfig {
                    remote: "https://github.com/acme/b.git".into(),
                    link_root: Some(Utf8PathBuf::from("/links")),
                    worktrees: vec![WorktreeConfig {
                        link: "shared".into(),
                        reference: "main".into(),
                        pathspecs: vec![],
                    }],
                    ..Default::default()
                },
            ],
        };
        assert!(validate_link_paths(&cfg).is_err());
    }

    #[test]
    fn validate_link_paths_allows_distinct_paths() {
        let cfg = Config {
            defaults: Defaults::default(),
            repositories: vec![RepositoryConfig {
                remote: "https://github.com/acme/a.git".into(),
                link_root: Some(Utf8PathBuf::from("/links")),
                worktrees: vec![
                    WorktreeConfig {
                        link: "one".into(),
                        reference: "main".into(),
                        pathspecs: vec![],
                    },
                    WorktreeConfig {
                        link: "two".into(),
                        reference: "dev".into(),
                        pathspecs: vec![],
                    },
                ],
                ..Default::default()
            }],
        };
        assert!(validate_link_paths(&cfg).is_ok());
    }
}

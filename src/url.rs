//! Remote URL parsing for the four syntactic families the daemon accepts:
//! scp-style (`user@host:path/repo`), `ssh://`, `https://`, and `file://`.
//!
//! Produces a single `RemoteUrl` type with structural equality so the
//! pool can treat two syntactically different remotes for the same
//! repository as one.

use crate::error::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    ScpStyle,
    Ssh,
    Https,
    Local,
}

/// A parsed remote, compared structurally on `(host, path, repo-sans-".git")`.
#[derive(Debug, Clone)]
pub struct RemoteUrl {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub repo: String,
    original: String,
}

impl RemoteUrl {
    /// The canonical pool key: lowercased host plus path-sans-`.git`, the
    /// same fields `PartialEq`/`Hash` compare on, so two syntactically
    /// different remotes naming the same repository (scp-style vs. `ssh://`
    /// vs. `https://`) collide under the same key.
    pub fn normalised(&self) -> String {
        format!(
            "{}{}",
            self.host.as_deref().map(str::to_lowercase).unwrap_or_default(),
            self.path_sans_repo_git()
        )
    }

    fn repo_sans_git(&self) -> &str {
        self.repo.strip_suffix(".git").unwrap_or(&self.repo)
    }

    fn path_sans_repo_git(&self) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), self.repo_sans_git())
    }
}

impl PartialEq for RemoteUrl {
    fn eq(&self, other: &Self) -> bool {
        self.host.as_deref().map(str::to_lowercase) == other.host.as_deref().map(str::to_lowercase)
            && self.path_sans_repo_git() == other.path_sans_repo_git()
    }
}
impl Eq for RemoteUrl {}

impl std::hash::Hash for RemoteUrl {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.as_deref().map(str::to_lowercase).hash(state);
        self.path_sans_repo_git().hash(state);
    }
}

impl fmt::Display for RemoteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

/// Splits `user@host:path` at the `@` and the first `:` that follows it.
fn split_scp_scheme(value: &str) -> Option<(usize, usize)> {
    let at = value.find('@')?;
    let colon = value[at..].find(':')? + at;
    Some((at, colon))
}

fn split_host_port(hostport: &str) -> (String, Option<u16>) {
    if let Some((host, port)) = hostport.rsplit_once(':') {
        if let Ok(p) = port.parse::<u16>() {
            return (host.to_string(), Some(p));
        }
    }
    (hostport.to_string(), None)
}

fn repo_and_path(full_path: &str) -> Result<(String, String)> {
    let trimmed = full_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(Error::BadRemote("empty path".into()));
    }
    let (dir, repo) = match trimmed.rsplit_once('/') {
        Some((d, r)) => (d.to_string(), r.to_string()),
        None => (String::new(), trimmed.to_string()),
    };
    if repo.is_empty() || repo == ".git" {
        return Err(Error::BadRemote(format!(
            "repo name empty or literally '.git' in {full_path:?}"
        )));
    }
    Ok((dir, repo))
}

pub fn parse(raw: &str) -> Result<RemoteUrl> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::BadRemote("empty url".into()));
    }
    // Normalise a trailing '/' away before dispatch, so e.g.
    // `https://host/acme/widgets.git/` round-trips the same as without it.
    let raw = raw.trim_end_matches('/');
    if raw.is_empty() {
        return Err(Error::BadRemote("empty url".into()));
    }

    if let Some(rest) = raw.strip_prefix("file://") {
        let (path, repo) = repo_and_path(rest)?;
        return Ok(RemoteUrl {
            scheme: Scheme::Local,
            user: None,
            host: None,
            port: None,
            path: format!("/{path}"),
            repo,
            original: raw.to_string(),
        });
    }

    if let Some(rest) = raw.strip_prefix("ssh://") {
        return parse_authority_url(raw, rest, Scheme::Ssh);
    }

    if let Some(rest) = raw.strip_prefix("https://") {
        return parse_authority_url(raw, rest, Scheme::Https);
    }

    if let Some((at, colon)) = split_scp_scheme(raw) {
        let user = &raw[..at];
        let hostport = &raw[at + 1..colon];
        let path_part = &raw[colon + 1..];
        let (host, port) = split_host_port(hostport);
        let (path, repo) = repo_and_path(path_part)?;
        return Ok(RemoteUrl {
            scheme: Scheme::ScpStyle,
            user: Some(user.to_string()),
            host: Some(host),
            port,
            path: format!("/{path}"),
            repo,
            original: raw.to_string(),
        });
    }

    Err(Error::BadRemote(format!("unrecognised remote url: {raw:?}")))
}

fn parse_authority_url(original: &str, rest: &str, scheme: Scheme) -> Result<RemoteUrl> {
    let (authority, path_part) = rest
        .split_once('/')
        .ok_or_else(|| Error::BadRemote(format!("missing path in {original:?}")))?;

    let (user, hostport) = match authority.rsplit_once('@') {
        Some((u, h)) => (Some(u.to_string()), h),
        None => (None, authority),
    };
    let (host, port) = split_host_port(hostport);
    let (path, repo) = repo_and_path(path_part)?;

    Ok(RemoteUrl {
        scheme,
        user,
        host: Some(host),
        port,
        path: format!("/{path}"),
        repo,
        original: original.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scp_style() {
        let u = parse("git@github.com:acme/widgets.git").unwrap();
        assert_eq!(u.scheme, Scheme::ScpStyle);
        assert_eq!(u.host.as_deref(), Some("github.com"));
        assert_eq!(u.repo, "widgets.git");
    }

    #[test]
    fn parses_ssh_scheme() {
        let u = parse("ssh://git@github.com:22/acme/widgets.git").unwrap();
        assert_eq!(u.scheme, Scheme::Ssh);
        assert_eq!(u.port, Some(22));
        assert_eq!(u.path, "/acme");
    }

    #[test]
    fn parses_https() {
        let u = parse("https://github.com/acme/widgets.git").unwrap();
        assert_eq!(u.scheme, Scheme::Https);
        assert_eq!(u.host.as_deref(), Some("github.com"));
    }

    #[test]
    fn parses_file() {
        let u = parse("file:///srv/repos/widgets").unwrap();
        assert_eq!(u.scheme, Scheme::Local);
        assert_eq!(u.repo, "widgets");
    }

    #[test]
    fn equality_ignores_dot_git_suffix() {
        let a = parse("git@github.com:acme/widgets.git").unwrap();
        let b = parse("ssh://git@github.com/acme/widgets").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn normalised_is_case_insensitive_on_host_only() {
        let a = parse("https://GitHub.com/acme/widgets.git").unwrap();
        let b = parse("https://github.com/acme/widgets").unwrap();
        assert_eq!(a.normalised(), b.normalised());
    }

    #[test]
    fn normalised_matches_across_schemes_for_the_same_repo() {
        let a = parse("git@github.com:acme/widgets.git").unwrap();
        let b = parse("https://github.com/acme/widgets").unwrap();
        assert_eq!(a.normalised(), b.normalised());
    }

    #[test]
    fn rejects_empty_repo_name() {
        assert!(parse("https://github.com/").is_err());
    }

    #[test]
    fn trailing_slash_after_repo_is_normalised_away() {
        let a = parse("https://github.com/acme/widgets.git/").unwrap();
        let b = parse("https://github.com/acme/widgets.git").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_literal_dot_git_repo() {
        assert!(parse("https://github.com/acme/.git").is_err());
    }
}

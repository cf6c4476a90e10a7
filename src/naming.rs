//! Worktree directory naming and atomic symlink publication.

use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// `<basename(linkAbs)>_<first7(hex-sha256(linkAbs))>-<first7(H)>`
pub fn worktree_dir_name(link_abs: &Utf8Path, commit_hash: &str) -> String {
    let basename = link_abs.file_name().unwrap_or("link");
    let mut hasher = Sha256::new();
    hasher.update(link_abs.as_str().as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    let link_hash7 = &hex[..7];
    let commit7 = &commit_hash[..commit_hash.len().min(7)];
    format!("{basename}_{link_hash7}-{commit7}")
}

pub fn tracker_name(worktree_dir_name: &str) -> String {
    format!("{worktree_dir_name}-link-tracker")
}

/// Atomically publishes a symlink at `link_path` pointing (relatively) at
/// `target_path`: write a randomly-suffixed sibling, then rename over the
/// published path. The relative target lets `link_path`'s parent be
/// mounted at a different mount point than `target_path`'s.
pub fn publish_symlink(link_path: &Utf8Path, target_path: &Utf8Path) -> Result<()> {
    let parent = link_path
        .parent()
        .ok_or_else(|| Error::ValidationFailed(format!("link path {link_path} has no parent")))?;
    std::fs::create_dir_all(parent).map_err(|e| Error::io(parent.to_path_buf(), e))?;

    let rel = pathdiff(parent, target_path);

    let nonce: u64 = rand::thread_rng().gen();
    let tmp_path = Utf8PathBuf::from(format!("{link_path}-{nonce:016x}"));

    symlink(&rel, &tmp_path).map_err(|e| Error::io(tmp_path.clone(), e))?;
    std::fs::rename(&tmp_path, link_path).map_err(|e| Error::io(link_path.to_path_buf(), e))?;
    Ok(())
}

#[cfg(unix)]
fn symlink(original: &Utf8Path, link: &Utf8Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original.as_str(), link.as_str())
}

#[cfg(not(unix))]
fn symlink(original: &Utf8Path, link: &Utf8Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(original.as_str(), link.as_str())
}

/// Computes `target` relative to `base`, walking up through shared
/// ancestors. Both paths are expected to be absolute.
fn pathdiff(base: &Utf8Path, target: &Utf8Path) -> Utf8PathBuf {
    let base_components: Vec<&str> = base.as_str().split('/').filter(|c| !c.is_empty()).collect();
    let target_components: Vec<&str> = target
        .as_str()
        .split('/')
        .filter(|c| !c.is_empty())
        .collect();

    let common = base_components
        .iter()
        .zip(target_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = Utf8PathBuf::new();
    for _ in common..base_components.len() {
        rel.push("..");
    }
    for comp in &target_components[common..] {
        rel.push(comp);
    }
    if rel.as_str().is_empty() {
        rel.push(".");
    }
    rel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_names_differ_for_different_links_same_commit() {
        let a = worktree_dir_name(Utf8Path::new("/links/a"), "deadbeefdeadbeef");
        let b = worktree_dir_name(Utf8Path::new("/links/b"), "deadbeefdeadbeef");
        assert_ne!(a, b);
    }

    #[test]
    fn worktree_names_differ_for_different_commits_same_link() {
        let a = worktree_dir_name(Utf8Path::new("/links/a"), "1111111111111111");
        let b = worktree_dir_name(Utf8Path::new("/links/a"), "2222222222222222");
        assert_ne!(a, b);
    }

    #[test]
    fn worktree_name_is_deterministic() {
        let a = worktree_dir_name(Utf8Path::new("/links/a"), "1111111111111111");
        let b = worktree_dir_name(Utf8Path::new("/links/a"), "1111111111111111");
        assert_eq!(a, b);
    }

    #[test]
    fn tracker_name_suffixes_link_tracker() {
        assert_eq!(tracker_name("foo_1234567-89abcde"), "foo_1234567-89abcde-link-tracker");
    }

    #[test]
    fn pathdiff_computes_relative_path() {
        let base = Utf8Path::new("/a/b/c");
        let target = Utf8Path::new("/a/b/d/e");
        assert_eq!(pathdiff(base, target), Utf8PathBuf::from("../d/e"));
    }

    #[test]
    fn pathdiff_same_dir() {
        let base = Utf8Path::new("/a/b");
        let target = Utf8Path::new("/a/b/e");
        assert_eq!(pathdiff(base, target), Utf8PathBuf::from("e"));
    }

    #[test]
    fn publish_symlink_is_atomic_rename() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let target = root.join("worktrees").join("wt1");
        std::fs::create_dir_all(&target).unwrap();
        let link = root.join("links").join("HEAD");

        publish_symlink(&link, &target).unwrap();
        let resolved = std::fs::canonicalize(link.as_str()).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(target.as_str()).unwrap());

        // republish onto a new target must still resolve correctly and
        // leave no stray `-<nonce>` siblings beyond the published name.
        let target2 = root.join("worktrees").join("wt2");
        std::fs::create_dir_all(&target2).unwrap();
        publish_symlink(&link, &target2).unwrap();
        let resolved2 = std::fs::canonicalize(link.as_str()).unwrap();
        assert_eq!(resolved2, std::fs::canonicalize(target2.as_str()).unwrap());
    }
}

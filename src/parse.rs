//! Parsing of `git` subprocess textual output: fetch porcelain lines and
//! `ListCommitsWithChangedFiles`'s commit-with-changed-files listings.

/// One updated ref from `git fetch --porcelain`: `<op> <old> <new> <ref>`
/// where `<op>` is any single non-`=` character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchUpdate {
    pub op: char,
    pub old: String,
    pub new: String,
    pub reference: String,
}

pub fn parse_fetch_porcelain(output: &str) -> Vec<FetchUpdate> {
    let mut updates = Vec::new();
    for line in output.lines() {
        let mut chars = line.chars();
        let Some(op) = chars.next() else { continue };
        if op == '=' {
            continue;
        }
        let rest = chars.as_str().trim_start();
        let mut fields = rest.splitn(3, '\t');
        let first = fields.next();
        let (old_new, reference) = match first {
            Some(f) if f.contains(' ') => {
                let mut parts = f.splitn(2, ' ');
                let old = parts.next();
                let new = parts.next();
                (old.zip(new), fields.next())
            }
            _ => (None, None),
        };
        if let (Some((old, new)), Some(reference)) = (old_new, reference) {
            updates.push(FetchUpdate {
                op,
                old: old.to_string(),
                new: new.to_string(),
                reference: reference.to_string(),
            });
        }
    }
    updates
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitWithChangedFiles {
    pub hash: String,
    pub changed_files: Vec<String>,
}

fn is_hash_line(line: &str) -> bool {
    (line.len() == 40 || line.len() == 64) && line.chars().all(|c| c.is_ascii_hexdigit())
}

/// Consumes lines in order: a line matching the full commit-hash regex
/// starts a new record; any subsequent non-empty non-hash line is
/// appended to the most recent record's changed files. Leading/trailing
/// and inter-commit blank lines are ignored.
pub fn parse_commits_with_changed_files(output: &str) -> Vec<CommitWithChangedFiles> {
    let mut records: Vec<CommitWithChangedFiles> = Vec::new();
    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if is_hash_line(line) {
            records.push(CommitWithChangedFiles {
                hash: line.to_string(),
                changed_files: Vec::new(),
            });
        } else if let Some(last) = records.last_mut() {
            last.changed_files.push(line.to_string());
        }
    }
    records
}

/// Renders a record back into the textual form `parse_commits_with_changed_files`
/// accepts, used by the idempotency test.
pub fn render_commit_with_changed_files(record: &CommitWithChangedFiles) -> String {
    let mut s = String::new();
    s.push_str(&record.hash);
    s.push('\n');
    for f in &record.changed_files {
        s.push_str(f);
        s.push('\n');
    }
    s
}

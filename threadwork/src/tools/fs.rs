//! Filesystem tools run directly against a worktree.
//!
//! All paths are resolved relative to the worktree root and must stay inside
//! it, including through symlinks.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use ignore::WalkBuilder;
use regex::Regex;

use super::MAX_SEARCH_HITS;

/// Files larger than this are skipped by search.
const SEARCH_MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Resolve `requested` (relative, or absolute under `root`) to a relative path
/// that cannot leave `root`.
pub fn relative_path(root: &Path, requested: &str) -> Result<PathBuf> {
    let requested = requested.trim();
    let raw = Path::new(if requested.is_empty() { "." } else { requested });
    let raw = if raw.is_absolute() {
        raw.strip_prefix(root)
            .map_err(|_| anyhow!("path {} is outside the repository", raw.display()))?
    } else {
        raw
    };
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    bail!("path {requested} escapes the repository");
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("path {requested} is outside the repository")
            }
        }
    }
    Ok(out)
}

/// Resolve to an absolute host path inside `root`, rejecting symlink escapes.
fn confine(root: &Path, requested: &str) -> Result<PathBuf> {
    let rel = relative_path(root, requested)?;
    let root = root
        .canonicalize()
        .with_context(|| format!("resolve worktree {}", root.display()))?;
    let full = root.join(&rel);

    // Canonicalize the deepest existing ancestor; the rest does not exist yet.
    let mut existing = full.as_path();
    while !existing.exists() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    let resolved = existing
        .canonicalize()
        .with_context(|| format!("resolve {}", existing.display()))?;
    if !resolved.starts_with(&root) {
        bail!("path {requested} resolves outside the repository");
    }
    Ok(full)
}

pub fn read_file(root: &Path, path: &str, offset: usize, limit: Option<usize>) -> Result<String> {
    let full = confine(root, path)?;
    if full.is_dir() {
        bail!("{path} is a directory");
    }
    let bytes = fs::read(&full).with_context(|| format!("read {path}"))?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(select_lines(&text, offset, limit))
}

/// Lines `offset..offset+limit` of `text`, keeping line endings.
pub fn select_lines(text: &str, offset: usize, limit: Option<usize>) -> String {
    if offset == 0 && limit.is_none() {
        return text.to_string();
    }
    let lines = text.split_inclusive('\n').skip(offset);
    match limit {
        Some(limit) => lines.take(limit).collect(),
        None => lines.collect(),
    }
}

pub fn write_file(root: &Path, path: &str, content: &str, append: bool) -> Result<String> {
    let full = confine(root, path)?;
    if full.is_dir() {
        bail!("{path} is a directory");
    }
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create parent of {path}"))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(&full)
        .with_context(|| format!("open {path}"))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("write {path}"))?;
    let verb = if append { "appended" } else { "wrote" };
    Ok(format!("{verb} {} bytes to {path}", content.len()))
}

pub fn list_directory(root: &Path, path: &str) -> Result<String> {
    let full = confine(root, path)?;
    let mut names = Vec::new();
    for entry in fs::read_dir(&full).with_context(|| format!("list {}", display_path(path)))? {
        let entry = entry.context("read directory entry")?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == ".git" {
            continue;
        }
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        names.push(if is_dir { format!("{name}/") } else { name });
    }
    names.sort();
    if names.is_empty() {
        return Ok(format!("{} is empty", display_path(path)));
    }
    Ok(names.join("\n"))
}

pub fn search_files(root: &Path, pattern: &str, path: &str) -> Result<String> {
    let regex = Regex::new(pattern).with_context(|| format!("invalid pattern {pattern:?}"))?;
    let start = confine(root, path)?;
    let root = root
        .canonicalize()
        .with_context(|| format!("resolve worktree {}", root.display()))?;

    let mut builder = WalkBuilder::new(&start);
    builder
        .hidden(false)
        .follow_links(false)
        .require_git(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| entry.file_name() != ".git");

    let mut hits = Vec::new();
    let mut truncated = false;
    'walk: for entry in builder.build() {
        let Ok(entry) = entry else {
            continue;
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let file = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.len() > SEARCH_MAX_FILE_BYTES {
            continue;
        }
        let Ok(text) = fs::read_to_string(file) else {
            continue;
        };
        let rel = file.strip_prefix(&root).unwrap_or(file).display().to_string();
        for (idx, line) in text.lines().enumerate() {
            if regex.is_match(line) {
                if hits.len() == MAX_SEARCH_HITS {
                    truncated = true;
                    break 'walk;
                }
                hits.push(format!("{rel}:{}: {}", idx + 1, line.trim_end()));
            }
        }
    }

    if hits.is_empty() {
        return Ok(format!("no matches for {pattern:?}"));
    }
    let mut out = hits.join("\n");
    if truncated {
        out.push_str(&format!("\n[stopped after {MAX_SEARCH_HITS} matches]"));
    }
    Ok(out)
}

fn display_path(path: &str) -> &str {
    if path.trim().is_empty() { "." } else { path }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_rejects_escapes() {
        let root = Path::new("/repo");
        assert_eq!(
            relative_path(root, "src/../lib.rs").expect("inside"),
            PathBuf::from("lib.rs")
        );
        assert_eq!(
            relative_path(root, "/repo/notes.txt").expect("absolute inside"),
            PathBuf::from("notes.txt")
        );
        assert!(relative_path(root, "../etc/passwd").is_err());
        assert!(relative_path(root, "/etc/passwd").is_err());
    }

    #[test]
    fn write_append_then_read_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_file(temp.path(), "dir/notes.txt", "one\n", false).expect("write");
        write_file(temp.path(), "dir/notes.txt", "two\nthree\n", true).expect("append");

        let all = read_file(temp.path(), "dir/notes.txt", 0, None).expect("read");
        assert_eq!(all, "one\ntwo\nthree\n");
        let middle = read_file(temp.path(), "dir/notes.txt", 1, Some(1)).expect("read");
        assert_eq!(middle, "two\n");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("outside");
        std::os::unix::fs::symlink(outside.path(), temp.path().join("escape")).expect("symlink");
        assert!(write_file(temp.path(), "escape/x.txt", "x", false).is_err());
    }

    #[test]
    fn list_marks_directories_and_hides_git() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join(".git")).expect("git dir");
        fs::create_dir(temp.path().join("src")).expect("src");
        fs::write(temp.path().join("README.md"), "hi").expect("file");
        let listing = list_directory(temp.path(), "").expect("list");
        assert_eq!(listing, "README.md\nsrc/");
    }

    #[test]
    fn search_reports_path_and_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("src")).expect("src");
        fs::write(temp.path().join("src/lib.rs"), "fn a() {}\n// TODO fix\n").expect("file");
        fs::write(temp.path().join("other.txt"), "nothing here\n").expect("file");
        let out = search_files(temp.path(), "TODO", "").expect("search");
        assert_eq!(out, "src/lib.rs:2: // TODO fix");
    }

    #[test]
    fn search_skips_gitignored_trees() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join(".gitignore"), "build/\n").expect("gitignore");
        fs::create_dir(temp.path().join("build")).expect("build");
        fs::write(temp.path().join("build/gen.txt"), "TODO generated\n").expect("file");
        fs::write(temp.path().join("src.txt"), "TODO real\n").expect("file");
        let out = search_files(temp.path(), "TODO", "").expect("search");
        assert_eq!(out, "src.txt:1: TODO real");
    }

    #[test]
    fn search_with_bad_regex_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(search_files(temp.path(), "(", "").is_err());
    }
}

//! Architectural Enforcement Integration Tests
//!
//! This package scans the workspace sources and enforces:
//! - No sleep calls in production code (the typing engine waits on a condvar)
//! - No printing from the core library (only the CLI owns stdout)
//! - No `unwrap()`/`expect()` in core production code
//!
//! Production code is everything before a file's `#[cfg(test)]` line.

use std::fs;
use std::path::{Path, PathBuf};

/// One line of production code
#[derive(Clone, Debug)]
pub struct SourceLine {
    /// File the line came from
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Line text with any `//` comment removed
    pub code: String,
}

impl std::fmt::Display for SourceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.number, self.code.trim())
    }
}

/// Workspace root (two levels above this crate)
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Production lines of every `.rs` file under `dir` (relative to the
/// workspace root)
#[must_use]
pub fn production_lines(dir: &str) -> Vec<SourceLine> {
    let root = workspace_root().join(dir);
    let mut lines = Vec::new();
    if !root.exists() {
        return lines;
    }

    for entry in walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
            collect_file(entry.path(), &mut lines);
        }
    }
    lines
}

fn collect_file(path: &Path, lines: &mut Vec<SourceLine>) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };
    lines.extend(strip_tests(&content).into_iter().map(|(number, code)| SourceLine {
        path: path.to_path_buf(),
        number,
        code,
    }));
}

/// Numbered code lines up to the first `#[cfg(test)]`, comments removed
#[must_use]
pub fn strip_tests(content: &str) -> Vec<(usize, String)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(|(idx, line)| {
            let code = line.split("//").next().unwrap_or(line);
            (idx + 1, code.to_string())
        })
        .filter(|(_, code)| !code.trim().is_empty())
        .collect()
}

/// Lines under `dirs` containing any of `patterns`
#[must_use]
pub fn find_violations(dirs: &[&str], patterns: &[&str]) -> Vec<SourceLine> {
    dirs.iter()
        .flat_map(|dir| production_lines(dir))
        .filter(|line| patterns.iter().any(|p| line.code.contains(p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_tests_drops_comments_and_test_module() {
        let source = "\
fn run() {
    // thread::sleep(d) in a comment
    wait(); // .sleep( here too
}

#[cfg(test)]
mod tests {
    fn slow() { std::thread::sleep(d); }
}
";
        let lines = strip_tests(source);
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|(_, code)| !code.contains("sleep")));
        assert_eq!(lines[1], (3, "    wait(); ".to_string()));
    }

    #[test]
    fn test_workspace_root_has_core() {
        assert!(workspace_root().join("conductor/core/src/lib.rs").exists());
    }
}

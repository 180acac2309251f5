//! Unified diff handling.
//!
//! Normalises candidate patches before they reach `git apply` and parses
//! diffs into files and hunks for test-target resolution.

use std::sync::LazyLock;

use regex::Regex;

static DIFF_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^diff --git a/(.*?) b/(.*?)$").expect("diff header regex is valid")
});

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -\d+(?:,\d+)? \+\d+(?:,\d+)? @@ ?(.*)$").expect("hunk header regex is valid")
});

/// How a file is changed by a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Added,
    Deleted,
    Modified,
    Renamed,
}

/// One line of a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Added(String),
    Removed(String),
}

/// A hunk with the function/class context git printed after `@@`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub context: String,
    pub lines: Vec<HunkLine>,
}

/// All changes to a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub old_path: String,
    pub new_path: String,
    pub change: FileChange,
    pub binary: bool,
    pub hunks: Vec<Hunk>,
}

impl FileDiff {
    /// Path of the file after the change is applied.
    pub fn path(&self) -> &str {
        &self.new_path
    }
}

/// Normalise a patch: drop markdown fences, CR characters and surrounding
/// blank lines, and guarantee a trailing newline.
pub fn clean_patch(raw: &str) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }

    let without_cr = raw.replace('\r', "");
    let lines: Vec<&str> = without_cr
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect();

    let first = lines.iter().position(|l| !l.trim().is_empty()).unwrap_or(0);
    let last = lines
        .iter()
        .rposition(|l| !l.is_empty())
        .map_or(0, |i| i + 1);
    if first >= last {
        return String::new();
    }

    let mut out = lines[first..last].join("\n");
    out.push('\n');
    out
}

/// Whether the text is a git diff with at least one applicable change.
pub fn looks_like_diff(text: &str) -> bool {
    text.starts_with("diff --git")
        && (text.contains("\n@@")
            || text.contains("new file mode")
            || text.contains("deleted file mode"))
}

/// Concatenate the candidate fix and the test diff into one applicable patch.
pub fn combine(fix: &str, tests: &str) -> String {
    match (fix.trim().is_empty(), tests.trim().is_empty()) {
        (true, true) => String::new(),
        (true, false) => clean_patch(tests),
        (false, true) => clean_patch(fix),
        (false, false) => format!("{}\n{}", clean_patch(fix), clean_patch(tests)),
    }
}

/// Parse a unified git diff into per-file changes.
pub fn parse_diff(text: &str) -> Vec<FileDiff> {
    let mut files: Vec<FileDiff> = Vec::new();

    for line in text.lines() {
        if let Some(caps) = DIFF_HEADER.captures(line) {
            files.push(FileDiff {
                old_path: caps[1].to_string(),
                new_path: caps[2].to_string(),
                change: FileChange::Modified,
                binary: false,
                hunks: Vec::new(),
            });
            continue;
        }

        let Some(file) = files.last_mut() else {
            continue;
        };

        if let Some(caps) = HUNK_HEADER.captures(line) {
            file.hunks.push(Hunk {
                context: caps[1].to_string(),
                lines: Vec::new(),
            });
            continue;
        }

        if let Some(hunk) = file.hunks.last_mut() {
            if let Some(rest) = line.strip_prefix('+') {
                hunk.lines.push(HunkLine::Added(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix('-') {
                hunk.lines.push(HunkLine::Removed(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix(' ') {
                hunk.lines.push(HunkLine::Context(rest.to_string()));
            } else if line.is_empty() {
                hunk.lines.push(HunkLine::Context(String::new()));
            }
            continue;
        }

        if line.starts_with("new file mode") {
            file.change = FileChange::Added;
        } else if line.starts_with("deleted file mode") {
            file.change = FileChange::Deleted;
        } else if let Some(to) = line.strip_prefix("rename to ") {
            file.change = FileChange::Renamed;
            file.new_path = to.to_string();
        } else if line.starts_with("Binary files") || line.starts_with("GIT binary patch") {
            file.binary = true;
        }
    }

    files
}

/// Paths touched by a diff, in order of first appearance.
pub fn touched_files(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in text.lines().filter_map(|l| DIFF_HEADER.captures(l)) {
        let path = caps[2].to_string();
        if !seen.contains(&path) {
            seen.push(path);
        }
    }
    seen
}

//! `grep_files` adapter — regex search over a directory tree, honoring
//! ignore files, with the same sensitive-location gate as file reading.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::json;
use wf_domain::confirm::{Confirmer, OperationDetails};

use crate::sensitive::is_sensitive_path;
use crate::{gate, ToolError, ToolResult};

const MAX_MATCHES: usize = 200;
const MAX_LINE_CHARS: usize = 400;

#[derive(Debug, Clone, Deserialize)]
pub struct GrepRequest {
    /// Regular expression to search for.
    pub pattern: String,
    /// Directory (or single file) to search under.
    pub path: String,
    #[serde(default)]
    pub case_insensitive: bool,
    /// Cap on returned matches (default 200).
    #[serde(default)]
    pub max_results: Option<usize>,
}

pub async fn grep_files(req: GrepRequest, confirmer: Option<&dyn Confirmer>) -> ToolResult {
    let root = PathBuf::from(&req.path);
    if !root.exists() {
        return Err(ToolError::Failure(format!("path not found: {}", req.path)));
    }

    if is_sensitive_path(&root) {
        gate(
            confirmer,
            "grep_sensitive_path",
            &root.display().to_string(),
            OperationDetails {
                tool_name: "grep_files".into(),
                tool_args: json!({ "pattern": req.pattern, "path": req.path }),
                ..Default::default()
            },
        )
        .await?;
    }

    let pattern = if req.case_insensitive {
        format!("(?i){}", req.pattern)
    } else {
        req.pattern.clone()
    };
    let regex = regex::Regex::new(&pattern)
        .map_err(|e| ToolError::Failure(format!("invalid pattern '{}': {e}", req.pattern)))?;

    let max = req.max_results.unwrap_or(MAX_MATCHES);
    // Directory walking and file scanning are blocking work.
    let matches = tokio::task::spawn_blocking(move || scan(&root, &regex, max))
        .await
        .map_err(|e| ToolError::Failure(format!("grep task failed: {e}")))?;

    let count = matches.len();
    let truncated = count >= max;
    Ok(json!({
        "pattern": req.pattern,
        "path": req.path,
        "matches": matches,
        "count": count,
        "truncated": truncated,
    }))
}

#[derive(Debug, serde::Serialize)]
struct GrepMatch {
    file: String,
    line: usize,
    text: String,
}

/// Walk the tree (ignore-aware, skipping hidden credential dirs unless the
/// search root itself was confirmed) and collect matching lines.
fn scan(root: &Path, regex: &regex::Regex, max: usize) -> Vec<GrepMatch> {
    let mut out = Vec::new();
    let walker = ignore::WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .build();

    for entry in walker.flatten() {
        if out.len() >= max {
            break;
        }
        let path = entry.path();
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        // Never descend into credential locations below the root by accident.
        if path != root && is_sensitive_path(path) && !is_sensitive_path(root) {
            continue;
        }

        let Ok(content) = std::fs::read_to_string(path) else {
            continue; // binary or unreadable
        };
        for (i, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                let mut text = line.trim_end().to_owned();
                if text.len() > MAX_LINE_CHARS {
                    let mut end = MAX_LINE_CHARS;
                    while !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    text.truncate(end);
                    text.push_str("...");
                }
                out.push(GrepMatch {
                    file: path.display().to_string(),
                    line: i + 1,
                    text,
                });
                if out.len() >= max {
                    break;
                }
            }
        }
    }
    out
}

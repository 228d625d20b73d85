//! Files shared between the agent and the machine's users.
//!
//! Lines the agent owns are tagged either by a one-line comment marker (which
//! covers the line right after it) or by a start/end block. Everything else
//! belongs to the user and is preserved on every rewrite.

use std::io::Write;
use std::path::Path;

use tracing::debug;

use common::{GOOGLE_BLOCK_END, GOOGLE_BLOCK_START, GOOGLE_COMMENT};

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    Outside,
    AfterComment,
    InsideBlock,
}

/// The user-owned lines of `contents`, with every agent-managed line removed.
pub fn filter_google_lines(contents: &str) -> Vec<String> {
    let mut state = FilterState::Outside;
    let mut kept = Vec::new();
    for line in contents.lines() {
        let marker = line.trim();
        state = match (state, marker) {
            (FilterState::InsideBlock, m) if m == GOOGLE_BLOCK_END => FilterState::Outside,
            (FilterState::InsideBlock, _) => FilterState::InsideBlock,
            (_, m) if m == GOOGLE_BLOCK_START => FilterState::InsideBlock,
            (_, m) if m == GOOGLE_COMMENT => FilterState::AfterComment,
            (FilterState::AfterComment, _) => FilterState::Outside,
            // stray end marker
            (FilterState::Outside, m) if m == GOOGLE_BLOCK_END => FilterState::Outside,
            (FilterState::Outside, _) => {
                kept.push(line.to_string());
                FilterState::Outside
            }
        };
    }
    kept
}

/// User lines followed by each managed line under its own comment marker.
pub fn render_tagged(user_lines: &[String], managed: &[String]) -> String {
    let mut out = String::new();
    for line in user_lines {
        out.push_str(line);
        out.push('\n');
    }
    for line in managed {
        out.push_str(GOOGLE_COMMENT);
        out.push('\n');
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// A managed block at the top of the file, then the user lines. An empty
/// `block` drops the markers entirely.
pub fn render_block(block: &[String], user_lines: &[String]) -> String {
    let mut out = String::new();
    if !block.is_empty() {
        out.push_str(GOOGLE_BLOCK_START);
        out.push('\n');
        for line in block {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(GOOGLE_BLOCK_END);
        out.push('\n');
    }
    for line in user_lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Replace `path` with `contents` unless it already holds exactly that.
/// The replacement is written next to the target and renamed over it, so
/// readers never observe a partial file. Returns whether the file changed.
pub fn write_if_changed(path: &Path, contents: &str) -> Result<bool> {
    let existing = match std::fs::read_to_string(path) {
        Ok(s) => Some(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(AgentError::io(format!("read {}", path.display()), e)),
    };
    if existing.as_deref() == Some(contents) {
        debug!(path = %path.display(), "unchanged");
        return Ok(false);
    }
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| AgentError::io(format!("create temp file in {}", dir.display()), e))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| AgentError::io(format!("write {}", tmp.path().display()), e))?;
    if let Ok(meta) = std::fs::metadata(path) {
        std::fs::set_permissions(tmp.path(), meta.permissions())
            .map_err(|e| AgentError::io(format!("chmod {}", tmp.path().display()), e))?;
    }
    tmp.persist(path)
        .map_err(|e| AgentError::io(format!("replace {}", path.display()), e.error))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(lines: &[&str]) -> Vec<String> {
        filter_google_lines(&lines.join("\n"))
    }

    #[test]
    fn comment_marker_and_its_line_and_blocks_are_dropped() {
        let got = filter(&[
            "line1",
            "line2",
            GOOGLE_COMMENT,
            "line3 after google comment",
            "line4",
            GOOGLE_BLOCK_START,
            "line5 inside google block",
            "line6 inside google block",
            GOOGLE_BLOCK_END,
            "line7",
        ]);
        assert_eq!(got, vec!["line1", "line2", "line4", "line7"]);
    }

    #[test]
    fn repeated_comment_markers_cover_the_next_key_line() {
        let got = filter(&["line1", GOOGLE_COMMENT, GOOGLE_COMMENT, "key", "line2"]);
        assert_eq!(got, vec!["line1", "line2"]);
    }

    #[test]
    fn stray_block_end_is_ignored() {
        let got = filter(&["line1", "line2", GOOGLE_BLOCK_END, "line3", "line4"]);
        assert_eq!(got, vec!["line1", "line2", "line3", "line4"]);
    }

    #[test]
    fn block_at_start_of_file() {
        let got = filter(&[
            GOOGLE_BLOCK_START,
            "line1 inside google block",
            "line2 inside google block",
            GOOGLE_BLOCK_END,
            "line3",
        ]);
        assert_eq!(got, vec!["line3"]);
    }

    #[test]
    fn nested_block_start_needs_one_end() {
        let got = filter(&[
            GOOGLE_BLOCK_START,
            "line1 inside google block",
            GOOGLE_BLOCK_START,
            "line2 inside google block",
            GOOGLE_BLOCK_END,
            "line3",
            GOOGLE_BLOCK_END,
            "line4",
        ]);
        assert_eq!(got, vec!["line3", "line4"]);
    }

    #[test]
    fn comment_inside_block_is_just_block_content() {
        let got = filter(&[
            GOOGLE_BLOCK_END,
            GOOGLE_BLOCK_START,
            "line1 inside google block",
            "line2 inside google block",
            GOOGLE_COMMENT,
            GOOGLE_BLOCK_END,
            "line3",
        ]);
        assert_eq!(got, vec!["line3"]);
    }

    #[test]
    fn markers_match_after_trimming() {
        let got = filter(&["  # Added by Google  ", "ssh-rsa AAA google", "user line"]);
        assert_eq!(got, vec!["user line"]);
    }

    #[test]
    fn rendered_output_filters_back_to_user_lines() {
        let user = vec!["ssh-ed25519 AAAA me@laptop".to_string()];
        let tagged = render_tagged(&user, &["ssh-rsa BBBB managed".to_string()]);
        assert_eq!(
            tagged,
            "ssh-ed25519 AAAA me@laptop\n# Added by Google\nssh-rsa BBBB managed\n"
        );
        assert_eq!(filter_google_lines(&tagged), user);

        let block = render_block(&["AuthorizedKeysCommandUser root".to_string()], &user);
        assert!(block.starts_with(GOOGLE_BLOCK_START));
        assert_eq!(filter_google_lines(&block), user);
        assert_eq!(render_block(&[], &user), "ssh-ed25519 AAAA me@laptop\n");
    }

    #[test]
    fn write_if_changed_skips_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        assert!(write_if_changed(&path, "a\n").unwrap());
        assert!(!write_if_changed(&path, "a\n").unwrap());
        assert!(write_if_changed(&path, "b\n").unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "b\n");
    }
}

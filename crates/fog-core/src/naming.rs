//! Repo name validation and session branch naming.

use thiserror::Error;

/// Maximum branch name length in bytes (git refname limit headroom).
pub const MAX_BRANCH_BYTES: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamingError {
    #[error("repo must be in owner/repo format: {0}")]
    InvalidRepoName(String),
    #[error("branch name is protected: {0}")]
    ProtectedBranch(String),
}

/// Split and validate a fully qualified `owner/name` repo reference.
///
/// Both segments must match `[A-Za-z0-9_.-]+` and be neither `.` nor `..`.
pub fn split_repo_full_name(full_name: &str) -> Result<(String, String), NamingError> {
    let full_name = full_name.trim();
    let mut parts = full_name.split('/');
    let (owner, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) => (owner.trim(), name.trim()),
        _ => return Err(NamingError::InvalidRepoName(full_name.to_string())),
    };

    for segment in [owner, name] {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(NamingError::InvalidRepoName(full_name.to_string()));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(NamingError::InvalidRepoName(full_name.to_string()));
        }
    }

    Ok((owner.to_string(), name.to_string()))
}

/// Check whether a branch name is protected from session use.
pub fn is_protected_branch(branch: &str) -> bool {
    matches!(
        branch.trim().to_ascii_lowercase().as_str(),
        "main" | "master"
    )
}

/// Validate a caller-supplied branch name.
pub fn validate_branch_name(branch: &str) -> Result<(), NamingError> {
    if is_protected_branch(branch) {
        return Err(NamingError::ProtectedBranch(branch.to_string()));
    }
    Ok(())
}

/// Derive a session branch name from a prefix and the first prompt.
///
/// The prompt is lower-cased; `/`, `-`, `_` and `.` survive as-is; any
/// other run of non-alphanumerics collapses to a single `-`. The result
/// is `<prefix>/<slug>` trimmed to at most [`MAX_BRANCH_BYTES`] bytes.
pub fn generate_branch_name(prefix: &str, prompt: &str) -> String {
    let slug = slugify(prompt);
    let slug = if slug.is_empty() { "session" } else { &slug };
    let name = if prefix.is_empty() {
        slug.to_string()
    } else {
        format!("{prefix}/{slug}")
    };
    truncate_bytes(&name, MAX_BRANCH_BYTES)
}

fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_sep = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.') {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Trim a string to at most `max` bytes without splitting a character.
fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

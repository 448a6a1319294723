//! Commit and pull-request title derivation.

/// Maximum overall title length.
const MAX_TITLE_CHARS: usize = 256;
/// Maximum prompt excerpt length inside a derived title.
const MAX_PROMPT_EXCERPT_CHARS: usize = 120;

/// Resolve the title for a run's commit (and PR, when one is opened).
///
/// Preference order: first non-empty line of the caller-supplied title,
/// else `feat: <first non-empty prompt line>`, else a fixed fallback.
pub fn resolve_commit_title(custom_title: &str, prompt: &str) -> String {
    if let Some(title) = first_non_empty_line(custom_title) {
        return truncate_chars(title, MAX_TITLE_CHARS);
    }
    if let Some(line) = first_non_empty_line(prompt) {
        return format!("feat: {}", truncate_chars(line, MAX_PROMPT_EXCERPT_CHARS));
    }
    "feat: update code".to_string()
}

fn first_non_empty_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_title_wins() {
        assert_eq!(
            resolve_commit_title("Fix login\nextra", "Add OTP"),
            "Fix login"
        );
    }

    #[test]
    fn custom_title_skips_blank_lines() {
        assert_eq!(
            resolve_commit_title("\n\n  Ship it  \n", "prompt"),
            "Ship it"
        );
    }

    #[test]
    fn falls_back_to_prompt_line() {
        assert_eq!(
            resolve_commit_title("", "Add health endpoint\nwith tests"),
            "feat: Add health endpoint"
        );
    }

    #[test]
    fn prompt_excerpt_is_truncated() {
        let prompt = "x".repeat(300);
        let title = resolve_commit_title("", &prompt);
        assert_eq!(title, format!("feat: {}", "x".repeat(120)));
    }

    #[test]
    fn empty_inputs_use_fixed_fallback() {
        assert_eq!(resolve_commit_title("", ""), "feat: update code");
        assert_eq!(resolve_commit_title("  \n ", "\n\n"), "feat: update code");
    }

    #[test]
    fn long_custom_title_is_truncated() {
        let custom = "t".repeat(400);
        assert_eq!(resolve_commit_title(&custom, ""), "t".repeat(256));
    }
}

//! Task ID generation
//!
//! Task IDs use the format: `{6-char-hex}-task-{slug}`
//! Example: `019430-task-fix-login-flow`

/// Generate a task ID from the submission prompt
///
/// The slug is derived from the first few words of the prompt so the ID
/// stays readable in branch names and worktree paths.
pub fn generate_task_id(prompt: &str) -> String {
    let uuid = uuid::Uuid::now_v7();
    let hex_prefix = &uuid.to_string()[..6];
    let slug = slugify(prompt, 4);
    if slug.is_empty() {
        format!("{}-task", hex_prefix)
    } else {
        format!("{}-task-{}", hex_prefix, slug)
    }
}

/// Generate a short opaque ID for approval requests and tool-call correlation
pub fn short_request_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Slugify a prompt for use in IDs, keeping at most `max_words` words
fn slugify(text: &str, max_words: usize) -> String {
    text.to_lowercase()
        .chars()
        // Strip apostrophes entirely, replace other non-alphanumeric with hyphens
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(max_words)
        .collect::<Vec<_>>()
        .join("-")
}

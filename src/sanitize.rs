//! Title normalization shared by filename prediction and download resolution.

/// Characters that are rejected in file names on at least one platform.
pub const FORBIDDEN_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Upper bound, in characters, for a sanitized title.
pub const MAX_TITLE_CHARS: usize = 100;

/// Strips forbidden characters, caps the length and trims surrounding
/// whitespace. Trimming happens on both sides of the cut so that the result is
/// a fixed point: `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize(raw_title: &str) -> String {
    let cleaned: String = raw_title
        .chars()
        .filter(|c| !FORBIDDEN_CHARS.contains(c))
        .collect();
    let truncated: String = cleaned.trim().chars().take(MAX_TITLE_CHARS).collect();
    truncated.trim().to_string()
}

/// Returns the sanitized title, or `None` when nothing usable survives.
pub fn usable_title(raw_title: &str) -> Option<String> {
    let safe = sanitize(raw_title);
    if safe.is_empty() { None } else { Some(safe) }
}

/// Stand-in used when a title sanitizes to nothing.
pub fn placeholder_title(task_id: &str) -> String {
    let short: String = task_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();
    format!("track-{short}")
}

/// Returns a prefix of the string with at most `max_chars` characters,
/// respecting UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Collapses a provider body into a single log-friendly line.
pub fn snippet(s: &str, max_chars: usize) -> String {
    let flat: String = s
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let cut = prefix_chars(flat.trim(), max_chars);
    if cut.len() < flat.trim().len() {
        format!("{}...", cut)
    } else {
        cut.to_string()
    }
}

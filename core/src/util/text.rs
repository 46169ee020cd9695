/// Clip `s` to at most `max` bytes on a char boundary, marking the cut with `…`.
/// Keeps audit logs compact and safe for stderr.
pub fn preview(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut out = truncate_chars(s, max).to_string();
    out.push('…');
    out
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Head and tail excerpt joined by `marker` when `s` is longer than `head + tail` chars.
pub fn head_tail(s: &str, head: usize, tail: usize, marker: &str) -> String {
    let count = s.chars().count();
    if count <= head + tail {
        return s.to_string();
    }
    let first: String = s.chars().take(head).collect();
    let last: String = s.chars().skip(count - tail).collect();
    format!("{first}{marker}{last}")
}

/// Last `n` chars of `s`.
pub fn tail_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("héllo world", 2), "h…");
        assert_eq!(preview("abcdef", 3), "abc…");
    }

    #[test]
    fn head_tail_excerpt() {
        assert_eq!(head_tail("abcdefghij", 3, 2, ".."), "abc..ij");
        assert_eq!(head_tail("abc", 3, 2, ".."), "abc");
    }

    #[test]
    fn tail_keeps_last_chars() {
        assert_eq!(tail_chars("héllo", 4), "éllo");
        assert_eq!(tail_chars("ab", 5), "ab");
    }
}

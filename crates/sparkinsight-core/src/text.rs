pub fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    let len = s.len();
    if index >= len {
        return len;
    }

    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }

    index
}

/// Shorten `text` to at most `max_len` bytes for log lines, marking the cut with `...`.
pub fn preview(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let boundary = floor_char_boundary(text, max_len);
    format!("{}...", &text[..boundary])
}

/// What a password looks like wherever it is shown.
pub const MASK: &str = "******";

/// Replace every occurrence of `secret` in `text` with [`MASK`].
pub fn mask_secret(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        text.to_string()
    } else {
        text.replace(secret, MASK)
    }
}

/// Truncate error message to a reasonable number of lines for display
pub fn truncate_error_message(message: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = message.lines().collect();
    if lines.len() <= max_lines {
        message.to_string()
    } else {
        let truncated_lines = &lines[..max_lines];
        format!(
            "{}\n... (truncated {} more lines)",
            truncated_lines.join("\n"),
            lines.len() - max_lines
        )
    }
}

/// Horizontal rule used between sections of console output.
pub fn rule() -> String {
    "─".repeat(40)
}

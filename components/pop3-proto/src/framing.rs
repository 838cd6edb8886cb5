/// Splits `s` on any of `\r\n`, `\r`, or `\n`, always including the trailing
/// segment (even if empty). A `\r\n` pair is treated as a single separator,
/// not two. Used both to normalize message content to CRLF line endings and
/// to decide which lines need dot-stuffing in a multiline response.
pub fn split_lines_keep_empty(s: &str) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' => {
                lines.push(&s[start..i]);
                i += if bytes.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
                start = i;
            }
            b'\n' => {
                lines.push(&s[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    lines.push(&s[start..]);
    lines
}

/// Re-emits `s` with every line ending normalized to CRLF. Does not add a
/// trailing line ending if `s` didn't have one.
pub fn normalize_crlf(s: &str) -> String {
    split_lines_keep_empty(s).join("\r\n")
}

/// The position of the next line terminator in `s`, expressed as
/// `(content_end, consumed_end)`: bytes `[0, content_end)` are the line's
/// text, and `[0, consumed_end)` is the whole line including its
/// terminator. Returns `None` if no complete line is available yet,
/// including the case where `s` ends in a lone `\r` that might still turn
/// out to be the start of a `\r\n` pair once more data arrives.
pub fn find_line_end(s: &str) -> Option<(usize, usize)> {
    let bytes = s.as_bytes();
    for i in 0..bytes.len() {
        match bytes[i] {
            b'\n' => return Some((i, i + 1)),
            b'\r' => {
                return match bytes.get(i + 1) {
                    Some(b'\n') => Some((i, i + 2)),
                    Some(_) => Some((i, i + 1)),
                    None => None,
                };
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_mixed_line_endings() {
        let lines = split_lines_keep_empty("a\r\nb\rc\nd");
        assert_eq!(lines, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn keeps_trailing_empty_segment() {
        let lines = split_lines_keep_empty("a\r\nb\r\n");
        assert_eq!(lines, vec!["a", "b", ""]);
    }

    #[test]
    fn normalize_crlf_rewrites_bare_lf() {
        assert_eq!(normalize_crlf("a\nb\n"), "a\r\nb\r\n");
    }

    #[test]
    fn find_line_end_waits_on_lone_trailing_cr() {
        assert_eq!(find_line_end("abc\r"), None);
        assert_eq!(find_line_end("abc\r\n"), Some((3, 5)));
        assert_eq!(find_line_end("abc\rdef"), Some((3, 4)));
        assert_eq!(find_line_end("abc\n"), Some((3, 4)));
    }
}

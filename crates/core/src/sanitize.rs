//! Text sanitation: UTF-8 repair, HTML stripping, whitespace collapse,
//! word-boundary truncation. Every text field crossing the store boundary
//! goes through [`clean_utf8`].

/// Strip invalid UTF-8 sequences from a byte slice. Invalid bytes are
/// removed, never replaced, so the result of a second pass is identical
/// to the first and already-valid input comes back unchanged.
pub fn clean_utf8(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(prefix) = std::str::from_utf8(&rest[..valid_up_to]) {
                    out.push_str(prefix);
                }
                let skip = err.error_len().unwrap_or(rest.len() - valid_up_to);
                rest = &rest[valid_up_to + skip..];
            }
        }
    }
}

/// Sanitise a string that may have been built from untrusted bytes.
/// Also drops interior NUL characters, which Postgres text columns reject.
pub fn clean_text(input: &str) -> String {
    if input.contains('\0') {
        input.chars().filter(|c| *c != '\0').collect()
    } else {
        input.to_string()
    }
}

/// Remove HTML tags and decode the handful of entities that show up in
/// feed summaries. The output contains no '<' ... '>' runs.
pub fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    decode_entities(&out)
}

fn decode_entities(input: &str) -> String {
    input
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
}

/// Collapse runs of whitespace (including newlines) into single spaces
/// and trim the ends.
pub fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_space = true;
    for c in input.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Truncate to at most `max_chars` characters, cutting on a word
/// boundary when one exists in the tail.
pub fn truncate_words(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let cut: String = input.chars().take(max_chars).collect();
    match cut.rfind(' ') {
        // Only back up to the space when it doesn't cost most of the text.
        Some(pos) if pos > max_chars / 2 => cut[..pos].trim_end().to_string(),
        _ => cut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_utf8_is_identity_on_valid_input() {
        let s = "Geldig: café, naïef, €100";
        assert_eq!(clean_utf8(s.as_bytes()), s);
    }

    #[test]
    fn clean_utf8_strips_overlong_encoding() {
        // 0xC0 0x80 is an overlong NUL encoding — both bytes must go.
        let bytes = b"voor\xC0\x80na";
        assert_eq!(clean_utf8(bytes), "voorna");
    }

    #[test]
    fn clean_utf8_strips_lone_continuation_bytes() {
        let bytes = b"a\x80\x80b\xFFc";
        assert_eq!(clean_utf8(bytes), "abc");
    }

    #[test]
    fn clean_utf8_is_idempotent() {
        let bytes = b"x\xC3\x28y\xE2\x82z";
        let once = clean_utf8(bytes);
        let twice = clean_utf8(once.as_bytes());
        assert_eq!(once, twice);
    }

    #[test]
    fn clean_utf8_handles_truncated_tail() {
        // Valid 3-byte sequence start with no continuation at end of input.
        let bytes = b"einde\xE2\x82";
        assert_eq!(clean_utf8(bytes), "einde");
    }

    #[test]
    fn strip_html_removes_tags_and_decodes_entities() {
        let html = "<p>Kabinet &amp; Kamer</p><img src=\"x.jpg\">";
        assert_eq!(strip_html(html), "Kabinet & Kamer");
    }

    #[test]
    fn collapse_whitespace_flattens_runs() {
        assert_eq!(collapse_whitespace("  a\n\n  b\t c  "), "a b c");
    }

    #[test]
    fn truncate_words_cuts_on_boundary() {
        let text = "een twee drie vier";
        let out = truncate_words(text, 12);
        assert_eq!(out, "een twee");
        assert!(out.chars().count() <= 12);
    }

    #[test]
    fn truncate_words_keeps_exact_fit() {
        let text: String = std::iter::repeat("w ").take(1000).collect();
        let text = text.trim_end().to_string();
        assert_eq!(truncate_words(&text, 2000), text);
    }

    #[test]
    fn clean_text_drops_nul() {
        assert_eq!(clean_text("a\0b"), "ab");
    }
}

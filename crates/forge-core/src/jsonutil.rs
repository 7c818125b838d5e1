//! Minimal JSON string escaping, used when composing NDJSON/HTTP bodies by
//! hand rather than through a typed `Serialize` value (spec §8).

/// Escapes `s` for embedding inside a double-quoted JSON string (the
/// surrounding quotes are NOT added). Any valid UTF-8 input round-trips:
/// wrapping the result in `"`..`"` and parsing it back yields `s` exactly.
pub fn escape_for_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) <= 0x1F => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrips(s: &str) {
        let quoted = format!("\"{}\"", escape_for_json(s));
        let parsed: String = serde_json::from_str(&quoted).unwrap();
        assert_eq!(parsed, s);
    }

    #[test]
    fn plain_ascii_passes_through() {
        assert_eq!(escape_for_json("hello"), "hello");
    }

    #[test]
    fn quote_and_backslash_are_escaped() {
        assert_eq!(escape_for_json("a\"b\\c"), "a\\\"b\\\\c");
    }

    #[test]
    fn control_characters_become_u00xx() {
        assert_eq!(escape_for_json("\u{0001}"), "\\u0001");
        assert_eq!(escape_for_json("\u{001f}"), "\\u001f");
    }

    #[test]
    fn roundtrips_through_serde_json() {
        roundtrips("plain text");
        roundtrips("quote \" backslash \\ tab\tnewline\ncr\r");
        roundtrips("unicode: \u{1F600} \u{00e9}");
        roundtrips("\u{0000}\u{0007}\u{001f}");
    }
}

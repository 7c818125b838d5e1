//! Small free-function helpers for the HTTP surface described in spec §6.
//! There is no server wiring here — callers (forge-server) own the
//! listener; these functions only implement the exact parsing/formatting
//! contracts.

/// Largest request body accepted by the control surface, in bytes.
pub const MAX_BODY_SIZE: usize = 1 << 20;

pub fn body_within_limit(len: usize) -> bool {
    len <= MAX_BODY_SIZE
}

/// Extracts the 3-digit status code from an HTTP status line such as
/// `"HTTP/1.1 200 OK"`. Returns `None` if the line is too short to contain
/// one at the fixed offset (bytes 9..12).
pub fn status_code_from_line(line: &str) -> Option<u16> {
    if line.len() < 12 {
        return None;
    }
    line.get(9..12)?.parse().ok()
}

/// Extracts the value of `key` from a `key=value&key2=value2`-style query
/// string. The value runs up to the next `&` or end-of-string. Returns
/// `None` if `key` is absent.
pub fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return Some(v);
            }
        } else if pair == key {
            return Some("");
        }
    }
    None
}

/// Resolves the chat-thread id for a dashboard request: an absent
/// parameter defaults to `"web:dashboard"`; an explicitly empty value
/// stays empty.
pub fn thread_id_or_default(query: &str) -> String {
    match query_param(query, "thread") {
        Some(v) => v.to_string(),
        None => "web:dashboard".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_limit_is_strict() {
        assert!(body_within_limit(MAX_BODY_SIZE));
        assert!(!body_within_limit(MAX_BODY_SIZE + 1));
    }

    #[test]
    fn status_line_too_short_is_none() {
        assert_eq!(status_code_from_line("HTTP/1.1 20"), None);
    }

    #[test]
    fn status_line_parses_code() {
        assert_eq!(status_code_from_line("HTTP/1.1 200 OK"), Some(200));
        assert_eq!(status_code_from_line("HTTP/1.1 404 Not Found"), Some(404));
    }

    #[test]
    fn query_param_extraction() {
        assert_eq!(query_param("a=1&b=2", "b"), Some("2"));
        assert_eq!(query_param("a=1&b=2", "c"), None);
        assert_eq!(query_param("a=1&thread=", "thread"), Some(""));
    }

    #[test]
    fn thread_id_defaults_when_absent_but_not_when_empty() {
        assert_eq!(thread_id_or_default("a=1"), "web:dashboard");
        assert_eq!(thread_id_or_default("thread="), "");
        assert_eq!(thread_id_or_default("thread=abc"), "abc");
    }
}

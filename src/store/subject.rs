//! Dot-separated subjects and wildcard filters.
//!
//! A subject is a sequence of non-empty tokens joined by `.`, e.g.
//! `RUN_EVENTS.gitlab`. Filters may use `*` to match exactly one token and a
//! trailing `>` to match one or more remaining tokens.

/// Returns true if `token` can be embedded in a subject.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && !token
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace() || c.is_control())
}

/// Returns true if `subject` is a literal subject (no wildcards, no empty tokens).
pub fn is_valid_subject(subject: &str) -> bool {
    subject.split('.').all(is_valid_token)
}

/// Returns true if `filter` is a well-formed filter.
pub fn is_valid_filter(filter: &str) -> bool {
    let tokens: Vec<&str> = filter.split('.').collect();
    tokens.iter().enumerate().all(|(i, t)| match *t {
        "*" => true,
        ">" => i == tokens.len() - 1,
        t => is_valid_token(t),
    })
}

/// Returns true if `subject` matches `filter`.
pub fn matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Returns true if some subject could match both filters.
pub fn overlaps(a: &str, b: &str) -> bool {
    let mut a_tokens = a.split('.');
    let mut b_tokens = b.split('.');

    loop {
        match (a_tokens.next(), b_tokens.next()) {
            (Some(">"), Some(_)) | (Some(_), Some(">")) => return true,
            (Some("*"), Some(_)) | (Some(_), Some("*")) => {}
            (Some(x), Some(y)) if x == y => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Joins a subject prefix and a token.
pub fn join(prefix: &str, token: &str) -> String {
    format!("{}.{}", prefix, token)
}

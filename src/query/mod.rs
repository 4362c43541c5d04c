// Query execution: the simple-query path, the extended-query handlers and
// the local SET/SHOW interception.
pub mod extended;
pub mod set_handler;
pub mod simple;

pub use extended::ExtendedQueryHandler;
pub use set_handler::SetHandler;
pub use simple::QueryExecutor;

/// Split a simple-query batch into statements on semicolons outside
/// single/double quotes and dollar-quoted strings. Comments are left in
/// place; empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => i = skip_quoted(bytes, i, b'\''),
            b'"' => i = skip_quoted(bytes, i, b'"'),
            b'$' => {
                if let Some(end) = skip_dollar_quoted(sql, i) {
                    i = end;
                } else {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            b';' => {
                statements.push(&sql[start..i]);
                start = i + 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    statements.push(&sql[start..]);

    statements
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            // Doubled quotes escape themselves.
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    i
}

/// Returns the index just past a `$tag$ ... $tag$` string starting at
/// `start`, or None when `start` is not a dollar-quote opener.
fn skip_dollar_quoted(sql: &str, start: usize) -> Option<usize> {
    let rest = &sql[start + 1..];
    let tag_len = rest
        .char_indices()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
        .map(|(i, _)| i)?;
    if rest.as_bytes().get(tag_len) != Some(&b'$') {
        return None;
    }
    // A tag starting with a digit is a positional parameter, not a quote.
    if rest.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return None;
    }
    let delimiter = &sql[start..start + tag_len + 2];
    let body_start = start + delimiter.len();
    sql[body_start..]
        .find(delimiter)
        .map(|pos| body_start + pos + delimiter.len())
}

//! Canonical statement form.
//!
//! The canonical form replaces string and numeric literals with `?`, strips
//! comments and collapses whitespace. It is the cache key for
//! classification results, so it must be deterministic and idempotent:
//! canonicalising an already-canonical statement yields the same text.

/// Canonicalize one SQL statement
pub fn canonicalize(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    // True when the previous emitted character ends an identifier; a digit
    // following an identifier is part of it, not a literal
    let mut prev_ident = false;
    let mut pending_space = false;

    while i < bytes.len() {
        let c = bytes[i];

        match c {
            b'\'' | b'"' => {
                i = skip_quoted(bytes, i, c);
                flush_space(&mut out, &mut pending_space);
                out.push('?');
                prev_ident = false;
            }
            b'`' => {
                let start = i;
                i = skip_quoted(bytes, i, b'`');
                flush_space(&mut out, &mut pending_space);
                out.push_str(&String::from_utf8_lossy(&bytes[start..i]));
                prev_ident = true;
            }
            b'#' => i = skip_line_comment(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && matches!(bytes.get(i + 2), None | Some(b' ') | Some(b'\t') | Some(b'\n')) =>
            {
                i = skip_line_comment(bytes, i)
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_block_comment(bytes, i);
                pending_space = !out.is_empty();
                prev_ident = false;
            }
            b'0'..=b'9' if !prev_ident => {
                i = skip_number(bytes, i);
                flush_space(&mut out, &mut pending_space);
                out.push('?');
                prev_ident = false;
            }
            b'.' if !prev_ident
                && matches!(bytes.get(i + 1), Some(b'0'..=b'9')) =>
            {
                i = skip_number(bytes, i);
                flush_space(&mut out, &mut pending_space);
                out.push('?');
                prev_ident = false;
            }
            c if c.is_ascii_whitespace() => {
                pending_space = !out.is_empty();
                i += 1;
            }
            c => {
                flush_space(&mut out, &mut pending_space);
                out.push(c as char);
                prev_ident = c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || c == b'?';
                i += 1;
            }
        }
    }

    out
}

fn flush_space(out: &mut String, pending: &mut bool) {
    if *pending {
        out.push(' ');
        *pending = false;
    }
}

/// Skip a quoted region, honoring backslash escapes and doubled quotes.
/// Returns the index just past the closing quote.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if quote != b'`' => i += 2,
            c if c == quote => {
                if bytes.get(i + 1) == Some(&quote) {
                    i += 2;
                } else {
                    return i + 1;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

/// Skip a numeric literal: integers, decimals, exponents, hex
fn skip_number(bytes: &[u8], start: usize) -> usize {
    let mut i = start;

    if bytes[i] == b'0' && matches!(bytes.get(i + 1), Some(b'x') | Some(b'X')) {
        i += 2;
        while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
            i += 1;
        }
        return i;
    }

    while i < bytes.len() {
        match bytes[i] {
            b'0'..=b'9' | b'.' => i += 1,
            b'e' | b'E' => {
                if matches!(bytes.get(i + 1), Some(b'0'..=b'9'))
                    || (matches!(bytes.get(i + 1), Some(b'+') | Some(b'-'))
                        && matches!(bytes.get(i + 2), Some(b'0'..=b'9')))
                {
                    i += 2;
                } else {
                    break;
                }
            }
            _ => break,
        }
    }
    i
}

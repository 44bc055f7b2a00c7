//! Lightweight transaction-boundary detection.
//!
//! Scans only as many tokens as needed to recognise statements that open or
//! close transactions or flip autocommit. This is the default detection
//! mode on the hot path; it must agree with the full classifier on every
//! canonical boundary statement.

use super::TypeMask;

/// Detect transaction boundaries in one statement. Returns an empty mask
/// for statements that do not affect transaction state.
pub fn trx_type_mask(sql: &str) -> TypeMask {
    let mut tokens = Tokenizer::new(sql);

    let first = match tokens.next() {
        Some(t) => t,
        None => return TypeMask::empty(),
    };

    if first.eq_ignore_ascii_case("begin") {
        // BEGIN [WORK]; `BEGIN NOT ATOMIC` is a compound statement, not a
        // transaction start
        return match tokens.next() {
            Some(t) if t.eq_ignore_ascii_case("not") => TypeMask::empty(),
            _ => TypeMask::BEGIN_TRX,
        };
    }

    if first.eq_ignore_ascii_case("start") {
        match tokens.next() {
            Some(t) if t.eq_ignore_ascii_case("transaction") => {}
            _ => return TypeMask::empty(),
        }
        let mut mask = TypeMask::BEGIN_TRX;
        // START TRANSACTION READ ONLY | READ WRITE | WITH CONSISTENT SNAPSHOT
        if let Some(t) = tokens.next() {
            if t.eq_ignore_ascii_case("read") {
                match tokens.next() {
                    Some(t) if t.eq_ignore_ascii_case("only") => mask |= TypeMask::READONLY,
                    Some(t) if t.eq_ignore_ascii_case("write") => mask |= TypeMask::READWRITE,
                    _ => {}
                }
            }
        }
        return mask;
    }

    if first.eq_ignore_ascii_case("commit") {
        return TypeMask::COMMIT;
    }

    if first.eq_ignore_ascii_case("rollback") {
        // ROLLBACK TO SAVEPOINT does not end the transaction
        return match tokens.next() {
            Some(t) if t.eq_ignore_ascii_case("to") => TypeMask::empty(),
            _ => TypeMask::ROLLBACK,
        };
    }

    if first.eq_ignore_ascii_case("set") {
        return set_statement_mask(&mut tokens);
    }

    TypeMask::empty()
}

/// Classify the transaction-relevant SET statements:
/// `SET autocommit = ...` and `SET [GLOBAL|SESSION] TRANSACTION ...`
fn set_statement_mask(tokens: &mut Tokenizer<'_>) -> TypeMask {
    let mut next = match tokens.next() {
        Some(t) => t,
        None => return TypeMask::empty(),
    };

    let mut scope_global = false;
    let mut scope_session = false;
    if next.eq_ignore_ascii_case("global") {
        scope_global = true;
        next = match tokens.next() {
            Some(t) => t,
            None => return TypeMask::empty(),
        };
    } else if next.eq_ignore_ascii_case("session") || next.eq_ignore_ascii_case("local") {
        scope_session = true;
        next = match tokens.next() {
            Some(t) => t,
            None => return TypeMask::empty(),
        };
    }

    if next.eq_ignore_ascii_case("transaction") {
        // GLOBAL and SESSION scopes change a default; the unscoped form
        // applies to the next transaction only
        let mut mask = if scope_global {
            TypeMask::GSYSVAR_WRITE
        } else if scope_session {
            TypeMask::SESSION_WRITE
        } else {
            TypeMask::NEXT_TRX
        };
        let mut prev_read = false;
        for t in tokens.by_ref() {
            if t.eq_ignore_ascii_case("read") {
                prev_read = true;
            } else if prev_read && t.eq_ignore_ascii_case("only") {
                mask |= TypeMask::READONLY;
                prev_read = false;
            } else if prev_read && t.eq_ignore_ascii_case("write") {
                mask |= TypeMask::READWRITE;
                prev_read = false;
            } else {
                prev_read = false;
            }
        }
        return mask;
    }

    let var = next.trim_start_matches("@@")
        .trim_start_matches("session.")
        .trim_start_matches("SESSION.");
    if var.eq_ignore_ascii_case("autocommit") {
        // Enabling autocommit commits any open transaction; disabling it
        // opens one implicitly
        return match tokens.next().map(truthiness) {
            Some(Some(true)) => TypeMask::ENABLE_AUTOCOMMIT | TypeMask::COMMIT,
            Some(Some(false)) => TypeMask::DISABLE_AUTOCOMMIT | TypeMask::BEGIN_TRX,
            _ => TypeMask::empty(),
        };
    }

    TypeMask::empty()
}

fn truthiness(token: &str) -> Option<bool> {
    if token == "1" || token.eq_ignore_ascii_case("on") || token.eq_ignore_ascii_case("true") {
        Some(true)
    } else if token == "0" || token.eq_ignore_ascii_case("off") || token.eq_ignore_ascii_case("false")
    {
        Some(false)
    } else {
        None
    }
}

/// Word tokenizer that skips comments and treats `=`, `,` and `;` as
/// separators
struct Tokenizer<'a> {
    rest: &'a str,
}

impl<'a> Tokenizer<'a> {
    fn new(sql: &'a str) -> Self {
        Self { rest: sql }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        loop {
            self.rest = self.rest.trim_start_matches(|c: char| {
                c.is_whitespace() || c == '=' || c == ',' || c == ';'
            });

            if let Some(stripped) = self.rest.strip_prefix("/*") {
                self.rest = match stripped.find("*/") {
                    Some(end) => &stripped[end + 2..],
                    None => "",
                };
                continue;
            }
            if self.rest.starts_with("-- ") || self.rest.starts_with('#') {
                self.rest = match self.rest.find('\n') {
                    Some(end) => &self.rest[end + 1..],
                    None => "",
                };
                continue;
            }
            break;
        }

        if self.rest.is_empty() {
            return None;
        }

        let end = self
            .rest
            .find(|c: char| c.is_whitespace() || c == '=' || c == ',' || c == ';' || c == '(')
            .unwrap_or(self.rest.len());
        if end == 0 {
            // Punctuation we do not care about, e.g. '('
            self.rest = &self.rest[1..];
            return self.next();
        }

        let (token, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(token)
    }
}

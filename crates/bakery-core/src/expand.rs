//! `#N` positional parameters and `%Name%` variable references.
//!
//! Both substitutions run in a single left-to-right pass; substituted text is
//! never re-scanned. [`crate::variables::Variables`] loops explicitly when a
//! variable value references other variables.

use crate::error::ExpandError;
use crate::escape::is_escape_letter;

/// Replaces `#1`, `#2`, ... with section parameters and `#c` with the loop counter.
///
/// Out-of-range parameters stay literal. `#c` inside an escape sequence such
/// as `$#c` is left for the unescaper.
pub fn expand_params(text: &str, params: &[String], loop_counter: Option<i64>) -> String {
    if !text.contains('#') {
        return text.to_string();
    }

    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'#' || i + 1 >= bytes.len() {
            i += 1;
            continue;
        }

        let next = bytes[i + 1];
        if next.is_ascii_digit() {
            let digits_end = (i + 1..bytes.len())
                .find(|&j| !bytes[j].is_ascii_digit())
                .unwrap_or(bytes.len());
            let value = text[i + 1..digits_end]
                .parse::<usize>()
                .ok()
                .filter(|&n| n >= 1)
                .and_then(|n| params.get(n - 1));
            if let Some(value) = value {
                out.push_str(&text[last..i]);
                out.push_str(value);
                last = digits_end;
            }
            i = digits_end;
            continue;
        }

        if next.eq_ignore_ascii_case(&b'c') && !is_escape_letter(text, i + 1) {
            if let Some(counter) = loop_counter {
                out.push_str(&text[last..i]);
                out.push_str(&counter.to_string());
                last = i + 2;
            }
            i += 2;
            continue;
        }

        i += 1;
    }

    out.push_str(&text[last..]);
    out
}

/// Names referenced as `%Name%` in `text`, in order.
pub fn variable_refs(text: &str) -> Vec<&str> {
    let mut refs = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('%') {
        let after = &rest[open + 1..];
        match after.find('%') {
            Some(0) => rest = after,
            Some(close) => {
                refs.push(&after[..close]);
                rest = &after[close + 1..];
            }
            None => break,
        }
    }
    refs
}

/// Replaces every `%Name%` using `resolve`.
///
/// `resolve` returns `None` for an undefined name; the reference is then
/// handed to `undefined`, whose return value is substituted. `%%` is not a
/// reference and is kept.
pub fn expand_variables<R, U>(text: &str, mut resolve: R, mut undefined: U) -> Result<String, ExpandError>
where
    R: FnMut(&str) -> Option<String>,
    U: FnMut(&str) -> String,
{
    if !text.contains('%') {
        return Ok(text.to_string());
    }
    if text.matches('%').count() % 2 != 0 {
        return Err(ExpandError::UnbalancedPercent(text.to_string()));
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('%') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('%') {
            Some(0) => {
                out.push('%');
                rest = after;
            }
            Some(close) => {
                let name = &after[..close];
                match resolve(name) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&undefined(name)),
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

//! Escape sequences for characters that would otherwise be structural.
//!
//! Both spellings are accepted: `$#c` and the legacy `#$c`. Letters are
//! case-insensitive.
//!
//! | Sequence | Result |
//! |----------|--------|
//! | `$#c` | `,` |
//! | `$#p` | `%` |
//! | `$#q` | `"` |
//! | `$#s` | space |
//! | `$#t` | tab |
//! | `$#x` | CRLF |
//! | `$#z` | two NUL characters |
//! | `$#h` | `#` |

fn replacement(letter: char) -> Option<&'static str> {
    match letter.to_ascii_lowercase() {
        'c' => Some(","),
        'p' => Some("%"),
        'q' => Some("\""),
        's' => Some(" "),
        't' => Some("\t"),
        'x' => Some("\r\n"),
        'z' => Some("\0\0"),
        'h' => Some("#"),
        _ => None,
    }
}

/// Replaces escape sequences in a single left-to-right pass.
///
/// Output of one replacement is never re-scanned, so `#$h$c` yields `#$c`
/// rather than a comma.
pub fn unescape(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut i = 0;

    while i + 2 < bytes.len() {
        let prefix = (bytes[i], bytes[i + 1]);
        if prefix == (b'$', b'#') || prefix == (b'#', b'$') {
            if let Some(rep) = replacement(bytes[i + 2] as char) {
                out.push_str(&text[last..i]);
                out.push_str(rep);
                i += 3;
                last = i;
                continue;
            }
        }
        i += 1;
    }
    out.push_str(&text[last..]);
    out
}

/// True when `text` holds the escape prefix immediately before byte `index`.
pub(crate) fn is_escape_letter(text: &str, index: usize) -> bool {
    index >= 2
        && matches!(&text.as_bytes()[index - 2..index], b"$#" | b"#$")
        && text[index..].chars().next().and_then(replacement).is_some()
}

/// Inverse of [`unescape`] for quotes, tabs and CRLF line breaks.
pub fn escape(text: &str) -> String {
    text.replace("\r\n", "#$x")
        .replace('"', "#$q")
        .replace('\t', "#$t")
}

/// Formats an operand so that the tokenizer reads it back unchanged.
pub fn quote_operand(operand: &str) -> String {
    let escaped = operand.replace('"', "#$q");
    let needs_quotes = escaped.contains(',')
        || escaped.starts_with(char::is_whitespace)
        || escaped.ends_with(char::is_whitespace);
    if needs_quotes {
        format!("\"{escaped}\"")
    } else {
        escaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_both_spellings() {
        assert_eq!(unescape("a$#cb"), "a,b");
        assert_eq!(unescape("a#$cb"), "a,b");
        assert_eq!(unescape("100$#p"), "100%");
        assert_eq!(unescape("#$qquoted#$q"), "\"quoted\"");
        assert_eq!(unescape("a#$sb#$tc"), "a b\tc");
        assert_eq!(unescape("line#$xnext"), "line\r\nnext");
        assert_eq!(unescape("$#z"), "\0\0");
        assert_eq!(unescape("#$h1"), "#1");
    }

    #[test]
    fn test_unescape_is_case_insensitive() {
        assert_eq!(unescape("a#$Cb"), "a,b");
        assert_eq!(unescape("a$#Sb"), "a b");
    }

    #[test]
    fn test_unescape_single_pass() {
        assert_eq!(unescape("#$h$c"), "#$c");
    }

    #[test]
    fn test_unknown_sequences_untouched() {
        assert_eq!(unescape("#$y and $#"), "#$y and $#");
        assert_eq!(unescape("#1 #c"), "#1 #c");
        assert_eq!(unescape(""), "");
    }

    #[test]
    fn test_escape_reverses_unescape() {
        let text = "say \"hi\"\tthen\r\nstop";
        assert_eq!(escape(text), "say #$qhi#$q#$tthen#$xstop");
        assert_eq!(unescape(&escape(text)), text);
    }

    #[test]
    fn test_quote_operand() {
        assert_eq!(quote_operand("plain"), "plain");
        assert_eq!(quote_operand("a,b"), "\"a,b\"");
        assert_eq!(quote_operand(" padded"), "\" padded\"");
        assert_eq!(quote_operand("say \"hi\""), "say #$qhi#$q");
    }

    #[test]
    fn test_escape_letter_detection() {
        assert!(is_escape_letter("$#c", 2));
        assert!(is_escape_letter("x#$q", 3));
        assert!(!is_escape_letter("#c", 1));
        assert!(!is_escape_letter("$#1", 2));
    }
}

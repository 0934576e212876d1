//! Splits one raw script line into a [`Command`].
//!
//! The line is split on every `,`. Double-quoted operands may span several
//! slices; the merge state machine joins them back with a literal comma.
//! Operands are kept raw: variable expansion and escape substitution happen
//! when the command is dispatched, where the variable store is available.

use crate::command::{Command, SectionAddress};
use crate::error::ParseError;
use crate::opcode::{self, Opcode};

/// Prefixes that turn a whole line into a comment.
const COMMENT_PREFIXES: &[&str] = &["//", "#", ";"];

/// Tokenizes a line that does not belong to any section.
pub fn tokenize_line(text: &str) -> Result<Command, ParseError> {
    tokenize(text, SectionAddress::detached())
}

/// Tokenizes a raw line located at `address`.
pub fn tokenize(text: &str, address: SectionAddress) -> Result<Command, ParseError> {
    let line = text.trim();

    if line.is_empty() {
        return Ok(Command::new(line, Opcode::None, Vec::new(), address));
    }
    if COMMENT_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
        return Ok(Command::new(line, Opcode::Comment, Vec::new(), address));
    }

    if line.matches('"').count() % 2 != 0 {
        return Err(ParseError::MalformedCommand(format!(
            "double-quote count must be even in [{line}]"
        )));
    }

    let mut slices = line.split(',');
    let name = slices.next().unwrap_or_default().trim();
    let rest: Vec<&str> = slices.collect();
    let operands = split_operands(&rest)?;

    Ok(Command::new(line, opcode::resolve(name), operands, address))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeState {
    Normal,
    Merging,
}

/// Joins comma-split slices into operands, honoring double-quote spans.
///
/// Unquoted operands are trimmed. Whitespace inside a quoted span is kept,
/// and the span loses its surrounding quotes.
pub fn split_operands(slices: &[&str]) -> Result<Vec<String>, ParseError> {
    let mut operands = Vec::with_capacity(slices.len());
    let mut state = MergeState::Normal;
    let mut buffer = String::new();

    for raw in slices {
        match state {
            MergeState::Normal => {
                let slice = raw.trim();
                match (slice.find('"'), slice.rfind('"')) {
                    (None, _) => operands.push(slice.to_string()),
                    (Some(0), Some(last)) if slice.len() >= 2 && last == slice.len() - 1 => {
                        let inner = &slice[1..last];
                        if inner.contains('"') {
                            return Err(stray_quote(slice));
                        }
                        operands.push(inner.to_string());
                    }
                    (Some(0), Some(0)) => {
                        buffer.clear();
                        buffer.push_str(&raw.trim_start()[1..]);
                        state = MergeState::Merging;
                    }
                    _ => return Err(stray_quote(slice)),
                }
            }
            MergeState::Merging => {
                let slice = raw.trim_end();
                match slice.find('"') {
                    None => {
                        buffer.push(',');
                        buffer.push_str(raw);
                    }
                    Some(idx) if idx == slice.len() - 1 => {
                        buffer.push(',');
                        buffer.push_str(&slice[..idx]);
                        operands.push(std::mem::take(&mut buffer));
                        state = MergeState::Normal;
                    }
                    Some(_) => return Err(stray_quote(slice.trim_start())),
                }
            }
        }
    }

    if state == MergeState::Merging {
        return Err(ParseError::MalformedOperand(format!(
            "unterminated double-quote in [\"{buffer}]"
        )));
    }
    Ok(operands)
}

fn stray_quote(slice: &str) -> ParseError {
    ParseError::MalformedOperand(format!("misplaced double-quote in [{slice}]"))
}

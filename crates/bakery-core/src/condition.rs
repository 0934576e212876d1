//! Parses the leading operands of an `If` command into a [`Condition`].
//!
//! Two shapes are recognized:
//!
//! - Comparison: `[Not,]<value>,<comparator>,<value>,<embedded...>`, chosen
//!   when the first value references a variable (`%Name%`) or a positional
//!   parameter (`#N`).
//! - Probe: `[Not,]<keyword>,<args...>,<embedded...>`, where the number of
//!   args comes from [`PredicateKind::arity`].
//!
//! `NotEqual`, `!=` and the deprecated `NotExistX` keywords fold into the
//! positive predicate with `negate` set.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredicateKind {
    Equal,
    /// Case-sensitive equality.
    EqualX,
    Smaller,
    Bigger,
    SmallerEqual,
    BiggerEqual,
    ExistFile,
    ExistDir,
    ExistSection,
    ExistRegSection,
    ExistRegKey,
    ExistVar,
    ExistMacro,
    Ping,
    Online,
}

/// Comparator keywords, with the negation they imply.
const COMPARATORS: &[(&str, PredicateKind, bool)] = &[
    ("Equal", PredicateKind::Equal, false),
    ("==", PredicateKind::Equal, false),
    ("EqualX", PredicateKind::EqualX, false),
    ("===", PredicateKind::EqualX, false),
    ("Smaller", PredicateKind::Smaller, false),
    ("<", PredicateKind::Smaller, false),
    ("Bigger", PredicateKind::Bigger, false),
    (">", PredicateKind::Bigger, false),
    ("SmallerEqual", PredicateKind::SmallerEqual, false),
    ("<=", PredicateKind::SmallerEqual, false),
    ("BiggerEqual", PredicateKind::BiggerEqual, false),
    (">=", PredicateKind::BiggerEqual, false),
    ("NotEqual", PredicateKind::Equal, true),
    ("!=", PredicateKind::Equal, true),
];

/// Probe keywords, with the negation they imply.
const PROBES: &[(&str, PredicateKind, bool)] = &[
    ("ExistFile", PredicateKind::ExistFile, false),
    ("ExistDir", PredicateKind::ExistDir, false),
    ("ExistSection", PredicateKind::ExistSection, false),
    ("ExistRegSection", PredicateKind::ExistRegSection, false),
    ("ExistRegKey", PredicateKind::ExistRegKey, false),
    ("ExistVar", PredicateKind::ExistVar, false),
    ("ExistMacro", PredicateKind::ExistMacro, false),
    ("Ping", PredicateKind::Ping, false),
    ("Online", PredicateKind::Online, false),
    ("NotExistFile", PredicateKind::ExistFile, true),
    ("NotExistDir", PredicateKind::ExistDir, true),
    ("NotExistSection", PredicateKind::ExistSection, true),
    ("NotExistRegSection", PredicateKind::ExistRegSection, true),
    ("NotExistRegKey", PredicateKind::ExistRegKey, true),
    ("NotExistVar", PredicateKind::ExistVar, true),
    ("NotExistMacro", PredicateKind::ExistMacro, true),
];

fn find(table: &[(&str, PredicateKind, bool)], token: &str) -> Option<(PredicateKind, bool)> {
    let token = token.trim();
    table
        .iter()
        .find(|(name, _, _)| name.eq_ignore_ascii_case(token))
        .map(|(_, kind, negate)| (*kind, *negate))
}

impl PredicateKind {
    /// Number of value operands the predicate takes.
    pub fn arity(self) -> usize {
        match self {
            PredicateKind::Equal
            | PredicateKind::EqualX
            | PredicateKind::Smaller
            | PredicateKind::Bigger
            | PredicateKind::SmallerEqual
            | PredicateKind::BiggerEqual => 2,
            PredicateKind::ExistFile
            | PredicateKind::ExistDir
            | PredicateKind::ExistVar
            | PredicateKind::ExistMacro
            | PredicateKind::Ping => 1,
            PredicateKind::ExistSection | PredicateKind::ExistRegSection => 2,
            PredicateKind::ExistRegKey => 3,
            PredicateKind::Online => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PredicateKind::Equal => "Equal",
            PredicateKind::EqualX => "EqualX",
            PredicateKind::Smaller => "Smaller",
            PredicateKind::Bigger => "Bigger",
            PredicateKind::SmallerEqual => "SmallerEqual",
            PredicateKind::BiggerEqual => "BiggerEqual",
            PredicateKind::ExistFile => "ExistFile",
            PredicateKind::ExistDir => "ExistDir",
            PredicateKind::ExistSection => "ExistSection",
            PredicateKind::ExistRegSection => "ExistRegSection",
            PredicateKind::ExistRegKey => "ExistRegKey",
            PredicateKind::ExistVar => "ExistVar",
            PredicateKind::ExistMacro => "ExistMacro",
            PredicateKind::Ping => "Ping",
            PredicateKind::Online => "Online",
        }
    }

    /// Canonical (non-negated) name lookup, case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        find(COMPARATORS, name)
            .or_else(|| find(PROBES, name))
            .filter(|(_, negate)| !negate)
            .map(|(kind, _)| kind)
    }
}

impl fmt::Display for PredicateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A structured `If` condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub predicate: PredicateKind,
    pub operands: Vec<String>,
    pub negate: bool,
}

impl Condition {
    /// Canonical operand list stored on an `IfCompact` node: `[Not,]Kind,args...`.
    pub fn to_operands(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.operands.len() + 2);
        if self.negate {
            out.push("Not".to_string());
        }
        out.push(self.predicate.name().to_string());
        out.extend(self.operands.iter().cloned());
        out
    }

    /// Reads back the canonical form produced by [`Condition::to_operands`].
    pub fn from_compact(operands: &[String]) -> Result<Self, ParseError> {
        let (negate, rest) = match operands.split_first() {
            Some((first, rest)) if first.eq_ignore_ascii_case("Not") => (true, rest),
            _ => (false, operands),
        };
        let (keyword, args) = rest.split_first().ok_or_else(|| {
            ParseError::MalformedOperand("compiled condition has no predicate".to_string())
        })?;
        let predicate =
            PredicateKind::from_name(keyword).ok_or_else(|| ParseError::InvalidPredicate {
                token: keyword.clone(),
                command: operands.join(","),
            })?;
        if args.len() != predicate.arity() {
            return Err(ParseError::MalformedOperand(format!(
                "[{predicate}] takes {} operand(s), found {}",
                predicate.arity(),
                args.len()
            )));
        }
        Ok(Self {
            predicate,
            operands: args.to_vec(),
            negate,
        })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_operands().join(","))
    }
}

/// True when the operand references a variable, a positional parameter or
/// the loop counter.
fn is_value_operand(operand: &str) -> bool {
    let percents = operand.matches('%').count();
    (percents > 0 && percents % 2 == 0) || has_param_ref(operand)
}

fn has_param_ref(operand: &str) -> bool {
    let bytes = operand.as_bytes();
    (0..bytes.len().saturating_sub(1)).any(|i| {
        bytes[i] == b'#'
            && (bytes[i + 1].is_ascii_digit()
                || (bytes[i + 1].eq_ignore_ascii_case(&b'c') && (i == 0 || bytes[i - 1] != b'$')))
    })
}

fn fold_negation(negate: &mut bool, implied: bool, cmd: &Command) -> Result<(), ParseError> {
    if implied {
        if *negate {
            return Err(ParseError::DuplicateNegation(cmd.origin.clone()));
        }
        *negate = true;
    }
    Ok(())
}

/// Parses the condition at the head of an `If` command.
///
/// Returns the condition and the index of the first operand after it, where
/// the embedded command name sits.
pub fn forge_condition(cmd: &Command) -> Result<(Condition, usize), ParseError> {
    let ops = &cmd.operands;
    let mut negate = false;
    let mut start = 0;
    if ops.first().is_some_and(|op| op.eq_ignore_ascii_case("Not")) {
        negate = true;
        start = 1;
    }

    let head = ops.get(start).ok_or_else(|| {
        ParseError::MalformedOperand(format!("missing branch condition in [{}]", cmd.origin))
    })?;

    if is_value_operand(head) {
        if ops.len() - start < 4 {
            return Err(ParseError::MalformedOperand(format!(
                "comparison needs a left value, a comparator, a right value and a command in [{}]",
                cmd.origin
            )));
        }
        let comparator = &ops[start + 1];
        let (predicate, implied) =
            find(COMPARATORS, comparator).ok_or_else(|| ParseError::InvalidPredicate {
                token: comparator.clone(),
                command: cmd.origin.clone(),
            })?;
        fold_negation(&mut negate, implied, cmd)?;
        let condition = Condition {
            predicate,
            operands: vec![head.clone(), ops[start + 2].clone()],
            negate,
        };
        return Ok((condition, start + 3));
    }

    let (predicate, implied) = find(PROBES, head).ok_or_else(|| ParseError::InvalidPredicate {
        token: head.clone(),
        command: cmd.origin.clone(),
    })?;
    fold_negation(&mut negate, implied, cmd)?;

    let args_start = start + 1;
    let args_end = args_start + predicate.arity();
    if ops.len() < args_end {
        return Err(ParseError::MalformedOperand(format!(
            "[{predicate}] takes {} operand(s) in [{}]",
            predicate.arity(),
            cmd.origin
        )));
    }
    let condition = Condition {
        predicate,
        operands: ops[args_start..args_end].to_vec(),
        negate,
    };
    Ok((condition, args_end))
}

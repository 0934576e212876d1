//! Error types shared by the parser, compiler and execution driver.
//!
//! Parse and compile errors are structural: they abort compiling the whole
//! section that contains them. Runtime errors are recovered per instruction
//! unless [`ExecError::is_critical`] says otherwise.

use thiserror::Error;

use crate::command::SectionAddress;

/// Grammar violations found while tokenizing a line or compiling a section.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line is structurally broken (odd double-quote count, compiled-only opcode in source).
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    /// An operand could not be extracted (stray or unterminated quote, missing operands).
    #[error("Malformed operand: {0}")]
    MalformedOperand(String),

    /// Unknown `If` sub-keyword or comparator.
    #[error("Invalid branch condition [{token}] in [{command}]")]
    InvalidPredicate {
        /// The offending keyword.
        token: String,
        /// The whole command line, for context.
        command: String,
    },

    /// `Not` prefix combined with `NotEqual`, `!=` or a deprecated `NotExistX` keyword.
    #[error("Branch condition [Not] cannot be duplicated in [{0}]")]
    DuplicateNegation(String),

    /// `Else` without a preceding `If`.
    #[error("[Else] must be used after [If]")]
    DanglingElse,

    /// `Else` whose embedded command is `Else` or `End`.
    #[error("[{0}] cannot be used as the body of [Else]")]
    InvalidElseBody(String),

    /// `If` whose embedded command is `Else` or `End`.
    #[error("[{0}] cannot be used as the body of [If]")]
    InvalidIfBody(String),

    /// `Begin` outside the embedded-command position of `If`/`Else`.
    #[error("[Begin] can only be used as the embedded command of [If] or [Else]")]
    OrphanBegin,

    /// `End` without a matching `Begin`.
    #[error("[End] does not match any [Begin]")]
    OrphanEnd,

    /// `Begin` that reaches the end of the section without its `End`.
    #[error("[Begin] must be matched with [End]")]
    UnmatchedBegin,

    /// `If`/`Else` with nothing to execute.
    #[error("[{0}] has no embedded command")]
    MissingEmbeddedCommand(String),
}

/// A [`ParseError`] located at a raw line of a section.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{address}: {source} [{line}]")]
pub struct CompileError {
    /// Where the offending line lives.
    pub address: SectionAddress,
    /// The offending raw line, trimmed.
    pub line: String,
    /// What went wrong.
    #[source]
    pub source: ParseError,
}

impl CompileError {
    pub fn new(address: SectionAddress, line: impl Into<String>, source: ParseError) -> Self {
        Self {
            address,
            line: line.into(),
            source,
        }
    }
}

/// Errors raised while expanding variables inside an operand.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpandError {
    /// Odd number of `%` characters: variable names must be enclosed by `%`.
    #[error("Variable names must be enclosed by %, found odd % count in [{0}]")]
    UnbalancedPercent(String),
}

/// Errors raised by the variable store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VariableError {
    #[error("Invalid variable name [{0}]")]
    InvalidName(String),

    #[error("Variable [{0}] contains a circular reference")]
    CircularReference(String),

    #[error("Fixed variable [{0}] cannot be overwritten")]
    ReadOnly(String),
}

/// Errors raised while executing compiled commands.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    /// A single instruction failed; execution continues with the next one.
    #[error("{0}")]
    Failed(String),

    /// Operand expansion failed.
    #[error(transparent)]
    Expand(#[from] ExpandError),

    /// A variable could not be written.
    #[error(transparent)]
    Variable(#[from] VariableError),

    /// No handler exists for a known opcode.
    #[error("Command [{0}] is not implemented")]
    NotImplemented(String),

    /// An external opcode that is not in the macro library.
    #[error("Macro [{0}] is not defined")]
    UnknownMacro(String),

    /// `Run`/`Exec`/`Loop` target is missing.
    #[error("Section [{section}] not found in [{script}]")]
    SectionNotFound { script: String, section: String },

    /// A section called at runtime failed to compile.
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// `Run`/`Exec` recursion exceeded the configured limit.
    #[error("Call depth limit [{0}] exceeded")]
    CallDepth(usize),

    /// Explicit `Halt`.
    #[error("Build halted: {0}")]
    Halt(String),
}

impl ExecError {
    /// Critical errors unwind the whole build instead of being logged and skipped.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ExecError::Compile(_) | ExecError::CallDepth(_) | ExecError::Halt(_)
        )
    }
}

/// Errors while loading scripts and projects.
#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("IO error on [{path}]: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("No script found in [{0}]")]
    Empty(String),
}

/// Errors while reading or writing the engine configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_errors_are_classified() {
        assert!(ExecError::Halt("stop".into()).is_critical());
        assert!(ExecError::CallDepth(64).is_critical());
        assert!(!ExecError::Failed("copy failed".into()).is_critical());
        assert!(!ExecError::UnknownMacro("Foo".into()).is_critical());
        assert!(!ExecError::SectionNotFound {
            script: "a".into(),
            section: "b".into()
        }
        .is_critical());
    }

    #[test]
    fn compile_error_display_names_line_and_address() {
        let err = CompileError::new(
            SectionAddress::new("main.script", "Process", 3).at_line(2),
            "End",
            ParseError::OrphanEnd,
        );
        let text = err.to_string();
        assert!(text.contains("Process"));
        assert!(text.contains("line 2"));
        assert!(text.contains("[End]"));
    }
}

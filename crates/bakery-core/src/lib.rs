//! # bakery-core
//!
//! Parser, control-flow compiler and execution driver for the bakery build
//! macro language.
//!
//! A bakery script is an ini-style text file made of `[Section]` blocks. Each
//! line of a code section is one instruction: a comma-separated opcode and
//! operand list, with double-quoted operands, `%Name%` variables and `#N`
//! positional parameters. Control flow is written as `If`/`Else` lines whose
//! embedded command may open a `Begin` ... `End` block.
//!
//! ## Modules
//!
//! - [`tokenizer`] - Turns one raw line into a [`Command`]
//! - [`opcode`] - Static, case-insensitive opcode table
//! - [`condition`] - Parses `If` operands into a structured [`Condition`]
//! - [`compiler`] - Rewrites `If`/`Else`/`Begin`/`End` into `IfCompact`/`ElseCompact` trees
//! - [`expand`] / [`escape`] - `%Name%` / `#N` expansion and `#$x` escape sequences
//! - [`variables`] - Local, global and fixed variable tiers
//! - [`script`] - Script files, sections and the [`Project`] repository
//! - [`engine`] - Execution driver walking compiled trees
//! - [`predicate`] - Evaluation of conditions against values and probes
//! - [`macros`] - User-defined opcodes loaded from a macro library script
//! - [`logger`] - Build log entries and sinks
//! - [`config`] - Persistent engine configuration
//!
//! ## Example
//!
//! ```
//! use bakery_core::compiler::compile_section;
//! use bakery_core::command::SectionAddress;
//! use bakery_core::opcode::Opcode;
//!
//! let lines = vec![
//!     "If,%A%,Equal,B,Echo,Success".to_string(),
//! ];
//! let address = SectionAddress::new("demo.script", "Process", lines.len());
//! let tree = compile_section(&lines, &address).unwrap();
//!
//! assert!(tree[0].is(Opcode::IfCompact));
//! assert_eq!(tree[0].body.as_ref().unwrap()[0].operands, vec!["Success"]);
//! ```

pub mod command;
pub mod compiler;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod escape;
pub mod expand;
pub mod logger;
pub mod macros;
pub mod opcode;
pub mod predicate;
pub mod script;
pub mod tokenizer;
pub mod variables;

pub use command::{Command, SectionAddress};
pub use compiler::compile_section;
pub use condition::{forge_condition, Condition, PredicateKind};
pub use engine::{BuildSummary, CommandHandler, Engine, ExecutionContext, Flow};
pub use error::{CompileError, ExecError, ParseError};
pub use opcode::{Opcode, OpcodeTag};
pub use script::{Project, Script, SectionRepository};
pub use tokenizer::tokenize_line;
pub use variables::{Scope, VariableStore, Variables};

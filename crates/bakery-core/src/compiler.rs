//! Block compiler: rewrites raw `If`/`Else`/`Begin`/`End` commands into
//! self-contained `IfCompact`/`ElseCompact` trees.
//!
//! Every line of a section is tokenized first. The flat list is then scanned
//! once, left to right:
//!
//! - `If` forges its condition and locates the embedded command. An embedded
//!   `If` nests a further `IfCompact` inside the first one (implicit AND). An
//!   embedded `Begin` pulls every line up to the matching `End` into the
//!   innermost body, compiled recursively.
//! - `Else` is legal only right after an `If` chain. Its embedded command is
//!   found on the same line, or on the next significant line when `Else`
//!   stands alone.
//! - A bare `Begin` or `End` is an error.
//!
//! Depth is relative to the start of the section: top-level nodes sit at 0,
//! every body one level deeper. `Run`/`Exec` leaves are lifted one level
//! because their target section is indented by the call itself.

use crate::command::{Command, SectionAddress};
use crate::condition::forge_condition;
use crate::error::{CompileError, ParseError};
use crate::opcode::{self, Opcode};
use crate::tokenizer::tokenize;

/// Tokenizes and compiles the raw lines of one section.
///
/// Any error aborts the whole section; nothing is partially compiled.
pub fn compile_section(
    lines: &[String],
    address: &SectionAddress,
) -> Result<Vec<Command>, CompileError> {
    let flat = parse_lines(lines, address)?;
    compile_commands(&flat)
}

/// Tokenizes each line independently, tagging it with its line index.
pub fn parse_lines(
    lines: &[String],
    address: &SectionAddress,
) -> Result<Vec<Command>, CompileError> {
    lines
        .iter()
        .enumerate()
        .map(|(idx, line)| {
            let at = address.at_line(idx);
            tokenize(line, at.clone()).map_err(|e| CompileError::new(at, line.trim(), e))
        })
        .collect()
}

/// Compiles an already tokenized flat command list.
///
/// Already compiled `IfCompact`/`ElseCompact` nodes pass through untouched,
/// so compiling a compiled list is a no-op.
pub fn compile_commands(flat: &[Command]) -> Result<Vec<Command>, CompileError> {
    BlockCompiler { cmds: flat }.block(0, flat.len(), 0)
}

/// Builds the embedded command that starts at operand `start` of `cmd`.
///
/// Returns `None` when there is no operand at `start` or it is blank.
pub fn forge_embedded_command(cmd: &Command, start: usize, depth: usize) -> Option<Command> {
    let name = cmd.operands.get(start)?.trim();
    if name.is_empty() {
        return None;
    }
    let mut embedded = Command::new(
        cmd.origin.clone(),
        opcode::resolve(name),
        cmd.operands[start + 1..].to_vec(),
        cmd.address.clone(),
    );
    embedded.depth = depth;
    Some(embedded)
}

/// Resolves an `If` line into its chain of `IfCompact` headers (empty bodies)
/// and the terminal embedded command.
///
/// `If,A,If,B,Echo,x` yields two headers at `depth` and `depth + 1` and the
/// terminal `Echo,x`.
pub fn resolve_if_chain(cmd: &Command, depth: usize) -> Result<(Vec<Command>, Command), ParseError> {
    let (condition, next) = forge_condition(cmd)?;
    let header = Command::compact(cmd, Opcode::IfCompact, condition.to_operands(), depth, Vec::new());
    let embedded = forge_embedded_command(cmd, next, depth + 1)
        .ok_or_else(|| ParseError::MissingEmbeddedCommand(cmd.origin.clone()))?;

    if embedded.is(Opcode::If) {
        let (mut chain, terminal) = resolve_if_chain(&embedded, depth + 1)?;
        chain.insert(0, header);
        Ok((chain, terminal))
    } else {
        Ok((vec![header], embedded))
    }
}

/// Folds a chain of headers around the innermost body, outermost node first.
fn nest_chain(chain: Vec<Command>, body: Vec<Command>) -> Vec<Command> {
    chain
        .into_iter()
        .rev()
        .fold(body, |inner, header| vec![header.with_body(inner)])
}

fn leaf(cmd: &Command, depth: usize) -> Command {
    match cmd.builtin() {
        Some(op) if op.is_section_call() => cmd.with_depth(depth.saturating_sub(1)),
        _ => cmd.with_depth(depth),
    }
}

fn fail(cmd: &Command, source: ParseError) -> CompileError {
    CompileError::new(cmd.address.clone(), cmd.origin.clone(), source)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    If,
    Else,
}

struct BlockCompiler<'a> {
    cmds: &'a [Command],
}

impl BlockCompiler<'_> {
    /// Compiles `cmds[start..end]` at `depth`.
    fn block(&self, start: usize, end: usize, depth: usize) -> Result<Vec<Command>, CompileError> {
        let mut out = Vec::new();
        let mut else_allowed = false;
        let mut idx = start;

        while idx < end {
            let cmd = &self.cmds[idx];
            match cmd.builtin() {
                Some(Opcode::If) => {
                    let (nodes, next) = self.if_statement(idx, end, depth)?;
                    out.extend(nodes);
                    else_allowed = true;
                    idx = next;
                }
                Some(Opcode::Else) => {
                    if !else_allowed {
                        return Err(fail(cmd, ParseError::DanglingElse));
                    }
                    let (node, next) = self.else_statement(idx, end, depth)?;
                    else_allowed = node.is_else_if();
                    out.push(node);
                    idx = next;
                }
                Some(Opcode::Begin) => return Err(fail(cmd, ParseError::OrphanBegin)),
                Some(Opcode::End) => return Err(fail(cmd, ParseError::OrphanEnd)),
                Some(op @ (Opcode::IfCompact | Opcode::ElseCompact)) => {
                    if cmd.body.is_none() {
                        return Err(fail(
                            cmd,
                            ParseError::MalformedCommand(format!("[{op}] cannot be written in a script")),
                        ));
                    }
                    if op == Opcode::ElseCompact && !else_allowed {
                        return Err(fail(cmd, ParseError::DanglingElse));
                    }
                    else_allowed = op == Opcode::IfCompact || cmd.is_else_if();
                    out.push(cmd.clone());
                    idx += 1;
                }
                Some(Opcode::None | Opcode::Comment) => {
                    out.push(cmd.with_depth(depth));
                    idx += 1;
                }
                _ => {
                    out.push(leaf(cmd, depth));
                    else_allowed = false;
                    idx += 1;
                }
            }
        }
        Ok(out)
    }

    /// Compiles the `If` at `idx`. Returns the chain root and the index after it.
    fn if_statement(
        &self,
        idx: usize,
        end: usize,
        depth: usize,
    ) -> Result<(Vec<Command>, usize), CompileError> {
        let cmd = &self.cmds[idx];
        let (chain, terminal) = resolve_if_chain(cmd, depth).map_err(|e| fail(cmd, e))?;
        let inner = depth + chain.len();
        let (body, next) = self.payload(idx, end, &terminal, inner, Owner::If)?;
        Ok((nest_chain(chain, body), next))
    }

    /// Compiles the `Else` at `idx`. Returns the node and the index after it.
    fn else_statement(
        &self,
        idx: usize,
        end: usize,
        depth: usize,
    ) -> Result<(Command, usize), CompileError> {
        let cmd = &self.cmds[idx];
        let missing = || fail(cmd, ParseError::MissingEmbeddedCommand(cmd.origin.clone()));
        let (embedded, anchor) = if cmd.operands.is_empty() {
            let anchor = self.next_significant(idx + 1, end).ok_or_else(missing)?;
            (self.cmds[anchor].with_depth(depth + 1), anchor)
        } else {
            (forge_embedded_command(cmd, 0, depth + 1).ok_or_else(missing)?, idx)
        };

        let (body, next) = if embedded.is(Opcode::If) {
            let (chain, terminal) =
                resolve_if_chain(&embedded, depth + 1).map_err(|e| fail(&embedded, e))?;
            let inner = depth + 1 + chain.len();
            let (body, next) = self.payload(anchor, end, &terminal, inner, Owner::If)?;
            (nest_chain(chain, body), next)
        } else {
            self.payload(anchor, end, &embedded, depth + 1, Owner::Else)?
        };

        Ok((Command::compact(cmd, Opcode::ElseCompact, Vec::new(), depth, body), next))
    }

    /// Builds the body for an embedded command found on line `anchor`.
    fn payload(
        &self,
        anchor: usize,
        end: usize,
        embedded: &Command,
        depth: usize,
        owner: Owner,
    ) -> Result<(Vec<Command>, usize), CompileError> {
        match embedded.builtin() {
            Some(Opcode::Begin) => {
                let close = self.match_begin_with_end(anchor, end)?;
                let body = self.block(anchor + 1, close, depth)?;
                Ok((body, close + 1))
            }
            Some(op @ (Opcode::Else | Opcode::End | Opcode::IfCompact | Opcode::ElseCompact)) => {
                let source = match owner {
                    Owner::If => ParseError::InvalidIfBody(op.name().to_string()),
                    Owner::Else => ParseError::InvalidElseBody(op.name().to_string()),
                };
                Err(fail(embedded, source))
            }
            _ => Ok((vec![leaf(embedded, depth)], anchor + 1)),
        }
    }

    fn next_significant(&self, start: usize, end: usize) -> Option<usize> {
        (start..end).find(|&idx| !self.cmds[idx].is_noop())
    }

    /// True when an `If` line's chain terminates in `Begin`.
    fn opens_block(&self, cmd: &Command) -> Result<bool, CompileError> {
        let (_, terminal) = resolve_if_chain(cmd, 0).map_err(|e| fail(cmd, e))?;
        Ok(terminal.is(Opcode::Begin))
    }

    /// Finds the `End` closing the `Begin` on line `anchor`.
    fn match_begin_with_end(&self, anchor: usize, end: usize) -> Result<usize, CompileError> {
        let mut nesting = 1usize;
        let mut pending_else = false;

        for idx in anchor + 1..end {
            let cmd = &self.cmds[idx];
            match cmd.builtin() {
                Some(Opcode::If) => {
                    pending_else = false;
                    if self.opens_block(cmd)? {
                        nesting += 1;
                    }
                }
                Some(Opcode::Else) => match forge_embedded_command(cmd, 0, 0) {
                    None => pending_else = true,
                    Some(embedded) => {
                        pending_else = false;
                        let opens = embedded.is(Opcode::Begin)
                            || (embedded.is(Opcode::If) && self.opens_block(&embedded)?);
                        if opens {
                            nesting += 1;
                        }
                    }
                },
                Some(Opcode::Begin) => {
                    if !pending_else {
                        return Err(fail(cmd, ParseError::OrphanBegin));
                    }
                    pending_else = false;
                    nesting += 1;
                }
                Some(Opcode::End) => {
                    pending_else = false;
                    nesting -= 1;
                    if nesting == 0 {
                        return Ok(idx);
                    }
                }
                Some(Opcode::None | Opcode::Comment) => {}
                _ => pending_else = false,
            }
        }

        Err(fail(&self.cmds[anchor], ParseError::UnmatchedBegin))
    }
}

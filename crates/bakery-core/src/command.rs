//! The unified command record produced by the tokenizer and the compiler.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::escape::quote_operand;
use crate::opcode::{Opcode, OpcodeTag};

/// Location of a command: script, section and zero-based line within the section.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectionAddress {
    pub script: Arc<str>,
    pub section: Arc<str>,
    pub line: usize,
    /// Number of lines in the section.
    pub sec_length: usize,
}

impl SectionAddress {
    pub fn new(script: impl Into<Arc<str>>, section: impl Into<Arc<str>>, sec_length: usize) -> Self {
        Self {
            script: script.into(),
            section: section.into(),
            line: 0,
            sec_length,
        }
    }

    /// Address for a line parsed outside of any section.
    pub fn detached() -> Self {
        Self::new("", "", 1)
    }

    pub fn at_line(&self, line: usize) -> Self {
        Self {
            line,
            ..self.clone()
        }
    }
}

impl fmt::Display for SectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] line {}", self.script, self.section, self.line)
    }
}

/// One instruction, either a leaf or a compiled `IfCompact`/`ElseCompact` node.
///
/// Compiled nodes own their `body`; leaves never have one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Trimmed raw source line.
    pub origin: String,
    pub opcode: OpcodeTag,
    pub operands: Vec<String>,
    pub address: SectionAddress,
    /// Nesting depth relative to the start of the section.
    pub depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<Command>>,
}

impl Command {
    pub fn new(
        origin: impl Into<String>,
        opcode: impl Into<OpcodeTag>,
        operands: Vec<String>,
        address: SectionAddress,
    ) -> Self {
        Self {
            origin: origin.into(),
            opcode: opcode.into(),
            operands,
            address,
            depth: 0,
            body: None,
        }
    }

    /// Compiled node carrying `operands` and `body`, located at `owner`'s line.
    pub fn compact(
        owner: &Command,
        opcode: Opcode,
        operands: Vec<String>,
        depth: usize,
        body: Vec<Command>,
    ) -> Self {
        Self {
            origin: owner.origin.clone(),
            opcode: OpcodeTag::Builtin(opcode),
            operands,
            address: owner.address.clone(),
            depth,
            body: Some(body),
        }
    }

    pub fn builtin(&self) -> Option<Opcode> {
        self.opcode.builtin()
    }

    pub fn is(&self, op: Opcode) -> bool {
        self.builtin() == Some(op)
    }

    pub fn is_external(&self) -> bool {
        matches!(self.opcode, OpcodeTag::External(_))
    }

    /// Blank and comment lines.
    pub fn is_noop(&self) -> bool {
        matches!(self.builtin(), Some(Opcode::None | Opcode::Comment))
    }

    pub fn with_depth(&self, depth: usize) -> Self {
        Self {
            depth,
            ..self.clone()
        }
    }

    pub fn with_body(mut self, body: Vec<Command>) -> Self {
        self.body = Some(body);
        self
    }

    /// True for an `IfCompact` nested in `parent` by an inline `If,...,If,...` chain.
    pub fn is_chain_link_of(&self, parent: &Command) -> bool {
        self.is(Opcode::IfCompact) && self.address == parent.address && self.origin == parent.origin
    }

    /// The single chained `IfCompact` in this node's body, if any.
    pub fn chained_if(&self) -> Option<&Command> {
        match self.body.as_deref() {
            Some([only]) if only.is_chain_link_of(self) => Some(only),
            _ => None,
        }
    }

    /// An `ElseCompact` written inline as `Else,If,...`.
    pub fn is_else_if(&self) -> bool {
        self.is(Opcode::ElseCompact) && self.chained_if().is_some()
    }

    /// Re-serializes opcode and operands as a source line.
    pub fn to_line(&self) -> String {
        match self.builtin() {
            Some(Opcode::None) => String::new(),
            Some(Opcode::Comment) => self.origin.clone(),
            _ => {
                let mut line = self.opcode.name().to_string();
                for operand in &self.operands {
                    line.push(',');
                    line.push_str(&quote_operand(operand));
                }
                line
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(op: Opcode, operands: &[&str]) -> Command {
        Command::new(
            "origin",
            op,
            operands.iter().map(|s| s.to_string()).collect(),
            SectionAddress::detached(),
        )
    }

    #[test]
    fn test_to_line_quotes_commas() {
        let c = cmd(Opcode::Echo, &["a,b", "plain"]);
        assert_eq!(c.to_line(), r#"Echo,"a,b",plain"#);
    }

    #[test]
    fn test_to_line_external() {
        let c = Command::new("x", OpcodeTag::External("ShowProgress".into()), vec!["1".into()], SectionAddress::detached());
        assert_eq!(c.to_line(), "ShowProgress,1");
    }

    #[test]
    fn test_chain_link_requires_same_line() {
        let address = SectionAddress::new("s", "Process", 4);
        let parent = Command::new("If,a", Opcode::IfCompact, vec![], address.at_line(1));
        let same = Command::new("If,a", Opcode::IfCompact, vec![], address.at_line(1));
        let other = Command::new("If,a", Opcode::IfCompact, vec![], address.at_line(2));
        assert!(same.is_chain_link_of(&parent));
        assert!(!other.is_chain_link_of(&parent));
    }

    #[test]
    fn test_address_display() {
        let address = SectionAddress::new("main.script", "Process", 10).at_line(7);
        assert_eq!(address.to_string(), "main.script [Process] line 7");
    }

    #[test]
    fn test_leaf_serializes_without_body() {
        let json = serde_json::to_value(cmd(Opcode::Echo, &["hi"])).unwrap();
        assert!(json.get("body").is_none());
        assert_eq!(json["operands"][0], "hi");
    }
}

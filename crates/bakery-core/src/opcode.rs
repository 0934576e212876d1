//! Opcode table and resolver.
//!
//! Opcode names are matched case-insensitively against a static table. A name
//! that is not in the table is never an error here: it becomes
//! [`OpcodeTag::External`] and is looked up in the macro library when the
//! command runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// The closed set of built-in instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Blank line, synthesized by the tokenizer.
    None,
    /// Comment line, synthesized by the tokenizer.
    Comment,

    // File
    CopyOrExpand,
    DirCopy,
    DirDelete,
    DirMove,
    DirMake,
    Expand,
    FileCopy,
    FileDelete,
    FileRename,
    FileMove,
    FileCreateBlank,
    FileByteExtract,

    // Registry
    RegHiveLoad,
    RegHiveUnload,
    RegImport,
    RegRead,
    RegWrite,
    RegDelete,
    RegWriteBin,
    RegReadBin,
    RegMulti,

    // Text
    TxtAddLine,
    TxtReplace,
    TxtDelLine,
    TxtDelSpaces,
    TxtDelEmptyLines,

    // Ini
    IniRead,
    IniWrite,
    IniDelete,
    IniAddSection,
    IniDeleteSection,
    IniWriteTextLine,
    IniMerge,

    // Network
    WebGet,
    WebGetIfNotExist,

    // Attachment
    ExtractFile,
    ExtractAndRun,
    ExtractAllFiles,
    Encode,

    // UI
    Message,
    Echo,
    Retrieve,
    Visible,

    // String
    StrFormat,

    // System
    System,
    ShellExecute,
    ShellExecuteEx,
    ShellExecuteDelete,

    // Branch
    Run,
    Exec,
    Loop,
    If,
    Else,
    Begin,
    End,

    // Control
    Set,
    GetParam,
    PackParam,
    AddVariables,
    Exit,
    Halt,
    Wait,
    Beep,

    // Compiled-only
    IfCompact,
    ElseCompact,
    Link,
}

/// Name table used by [`try_resolve_opcode`] and [`Opcode::name`].
///
/// `None` and `Comment` are absent: the tokenizer synthesizes them and no
/// source text resolves to them.
const OPCODE_NAMES: &[(&str, Opcode)] = &[
    ("CopyOrExpand", Opcode::CopyOrExpand),
    ("DirCopy", Opcode::DirCopy),
    ("DirDelete", Opcode::DirDelete),
    ("DirMove", Opcode::DirMove),
    ("DirMake", Opcode::DirMake),
    ("Expand", Opcode::Expand),
    ("FileCopy", Opcode::FileCopy),
    ("FileDelete", Opcode::FileDelete),
    ("FileRename", Opcode::FileRename),
    ("FileMove", Opcode::FileMove),
    ("FileCreateBlank", Opcode::FileCreateBlank),
    ("FileByteExtract", Opcode::FileByteExtract),
    ("RegHiveLoad", Opcode::RegHiveLoad),
    ("RegHiveUnload", Opcode::RegHiveUnload),
    ("RegImport", Opcode::RegImport),
    ("RegRead", Opcode::RegRead),
    ("RegWrite", Opcode::RegWrite),
    ("RegDelete", Opcode::RegDelete),
    ("RegWriteBin", Opcode::RegWriteBin),
    ("RegReadBin", Opcode::RegReadBin),
    ("RegMulti", Opcode::RegMulti),
    ("TXTAddLine", Opcode::TxtAddLine),
    ("TXTReplace", Opcode::TxtReplace),
    ("TXTDelLine", Opcode::TxtDelLine),
    ("TXTDelSpaces", Opcode::TxtDelSpaces),
    ("TXTDelEmptyLines", Opcode::TxtDelEmptyLines),
    ("IniRead", Opcode::IniRead),
    ("IniWrite", Opcode::IniWrite),
    ("IniDelete", Opcode::IniDelete),
    ("IniAddSection", Opcode::IniAddSection),
    ("IniDeleteSection", Opcode::IniDeleteSection),
    ("IniWriteTextLine", Opcode::IniWriteTextLine),
    ("IniMerge", Opcode::IniMerge),
    ("WebGet", Opcode::WebGet),
    ("WebGetIfNotExist", Opcode::WebGetIfNotExist),
    ("ExtractFile", Opcode::ExtractFile),
    ("ExtractAndRun", Opcode::ExtractAndRun),
    ("ExtractAllFiles", Opcode::ExtractAllFiles),
    ("Encode", Opcode::Encode),
    ("Message", Opcode::Message),
    ("Echo", Opcode::Echo),
    ("Retrieve", Opcode::Retrieve),
    ("Visible", Opcode::Visible),
    ("StrFormat", Opcode::StrFormat),
    ("System", Opcode::System),
    ("ShellExecute", Opcode::ShellExecute),
    ("ShellExecuteEx", Opcode::ShellExecuteEx),
    ("ShellExecuteDelete", Opcode::ShellExecuteDelete),
    ("Run", Opcode::Run),
    ("Exec", Opcode::Exec),
    ("Loop", Opcode::Loop),
    ("If", Opcode::If),
    ("Else", Opcode::Else),
    ("Begin", Opcode::Begin),
    ("End", Opcode::End),
    ("Set", Opcode::Set),
    ("GetParam", Opcode::GetParam),
    ("PackParam", Opcode::PackParam),
    ("AddVariables", Opcode::AddVariables),
    ("Exit", Opcode::Exit),
    ("Halt", Opcode::Halt),
    ("Wait", Opcode::Wait),
    ("Beep", Opcode::Beep),
    ("IfCompact", Opcode::IfCompact),
    ("ElseCompact", Opcode::ElseCompact),
    ("Link", Opcode::Link),
];

fn lookup() -> &'static HashMap<String, Opcode> {
    static LOOKUP: OnceLock<HashMap<String, Opcode>> = OnceLock::new();
    LOOKUP.get_or_init(|| {
        OPCODE_NAMES
            .iter()
            .map(|(name, op)| (name.to_ascii_lowercase(), *op))
            .collect()
    })
}

/// Case-insensitive lookup of a built-in opcode name.
pub fn try_resolve_opcode(name: &str) -> Option<Opcode> {
    lookup().get(&name.trim().to_ascii_lowercase()).copied()
}

/// Classifies an opcode token as built-in or external. Never fails.
pub fn resolve(name: &str) -> OpcodeTag {
    match try_resolve_opcode(name) {
        Some(op) => OpcodeTag::Builtin(op),
        None => OpcodeTag::External(name.trim().to_string()),
    }
}

impl Opcode {
    /// Canonical spelling, as written in scripts.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::None => "None",
            Opcode::Comment => "Comment",
            op => OPCODE_NAMES
                .iter()
                .find(|(_, candidate)| *candidate == op)
                .map(|(name, _)| *name)
                .unwrap_or("Unknown"),
        }
    }

    /// Opcodes kept for compatibility that log a warning when executed.
    pub fn is_deprecated(self) -> bool {
        matches!(
            self,
            Opcode::WebGetIfNotExist | Opcode::GetParam | Opcode::PackParam
        )
    }

    /// Raw control-flow opcodes that must not survive compilation.
    pub fn is_raw_branch(self) -> bool {
        matches!(self, Opcode::If | Opcode::Else | Opcode::Begin | Opcode::End)
    }

    /// Section calls, which do not indent their target.
    pub fn is_section_call(self) -> bool {
        matches!(self, Opcode::Run | Opcode::Exec)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A resolved opcode: a built-in instruction or an external macro reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name")]
pub enum OpcodeTag {
    Builtin(Opcode),
    External(String),
}

impl OpcodeTag {
    pub fn builtin(&self) -> Option<Opcode> {
        match self {
            OpcodeTag::Builtin(op) => Some(*op),
            OpcodeTag::External(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            OpcodeTag::Builtin(op) => op.name(),
            OpcodeTag::External(name) => name,
        }
    }
}

impl fmt::Display for OpcodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Opcode> for OpcodeTag {
    fn from(op: Opcode) -> Self {
        OpcodeTag::Builtin(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_case_insensitive() {
        assert_eq!(try_resolve_opcode("filecopy"), Some(Opcode::FileCopy));
        assert_eq!(try_resolve_opcode("FILECOPY"), Some(Opcode::FileCopy));
        assert_eq!(try_resolve_opcode("txtaddline"), Some(Opcode::TxtAddLine));
        assert_eq!(try_resolve_opcode(" If "), Some(Opcode::If));
    }

    #[test]
    fn test_unknown_name_is_external() {
        match resolve("ShowProgress") {
            OpcodeTag::External(name) => assert_eq!(name, "ShowProgress"),
            other => panic!("Expected External, got {other:?}"),
        }
    }

    #[test]
    fn test_pseudo_opcodes_not_resolvable() {
        assert_eq!(try_resolve_opcode("None"), None);
        assert_eq!(try_resolve_opcode("Comment"), None);
    }

    #[test]
    fn test_compiled_tags_resolve() {
        assert_eq!(try_resolve_opcode("ifcompact"), Some(Opcode::IfCompact));
        assert_eq!(try_resolve_opcode("ElseCompact"), Some(Opcode::ElseCompact));
        assert_eq!(try_resolve_opcode("link"), Some(Opcode::Link));
    }

    #[test]
    fn test_name_round_trips_through_table() {
        for (name, op) in OPCODE_NAMES {
            assert_eq!(op.name(), *name);
            assert_eq!(try_resolve_opcode(name), Some(*op));
        }
        assert_eq!(Opcode::None.name(), "None");
    }

    #[test]
    fn test_tag_serializes_with_kind() {
        let json = serde_json::to_string(&OpcodeTag::Builtin(Opcode::Echo)).unwrap();
        assert_eq!(json, r#"{"kind":"Builtin","name":"Echo"}"#);
        let json = serde_json::to_string(&OpcodeTag::External("Foo".into())).unwrap();
        assert_eq!(json, r#"{"kind":"External","name":"Foo"}"#);
    }
}

//! Macro library: user-defined opcodes.
//!
//! The main script's `[Variables]` section names the library with
//! `API=<script>` and, optionally, `APIVAR=<section>` (default `ApiVar`).
//! Each line of that section is `Name=Command,...`; calling `Name,a,b`
//! runs the command with `#1=a` and `#2=b`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::command::{Command, SectionAddress};
use crate::compiler::compile_commands;
use crate::error::CompileError;
use crate::logger::{LogEntry, LogState};
use crate::script::{parse_key_value, SectionRepository, VARIABLES_SECTION};
use crate::tokenizer::tokenize;
use crate::variables::{VariableStore, Variables};

pub const DEFAULT_MACRO_SECTION: &str = "ApiVar";

#[derive(Debug, Clone, PartialEq)]
pub struct Macro {
    pub name: String,
    pub commands: Arc<Vec<Command>>,
}

#[derive(Debug, Clone, Default)]
pub struct MacroLibrary {
    macros: HashMap<String, Macro>,
}

impl MacroLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the library declared by the main script.
    ///
    /// Problems are reported as log entries; a broken definition only loses
    /// that one macro.
    pub fn load(repo: &dyn SectionRepository, vars: &Variables) -> (Self, Vec<LogEntry>) {
        let mut library = Self::new();
        let mut log = Vec::new();

        let Some(main) = repo.main_script() else {
            return (library, log);
        };
        let settings: Vec<(String, String)> = repo
            .get_section(main, VARIABLES_SECTION)
            .map(|lines| lines.iter().filter_map(|l| parse_key_value(l)).collect())
            .unwrap_or_default();
        let setting = |key: &str| {
            settings
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| vars.expand(v).map(|e| e.text).unwrap_or_else(|_| v.clone()))
        };

        let Some(api) = setting("API") else {
            return (library, log);
        };
        let section = setting("APIVAR").unwrap_or_else(|| DEFAULT_MACRO_SECTION.to_string());

        let Some(script) = repo.resolve_script(&api) else {
            log.push(LogEntry::new(
                LogState::Warning,
                format!("Macro library [{api}] not found"),
            ));
            return (library, log);
        };
        let Some(lines) = repo.get_section(script, &section) else {
            log.push(LogEntry::new(
                LogState::Warning,
                format!("Macro section [{section}] not found in [{script}]"),
            ));
            return (library, log);
        };

        let address = SectionAddress::new(script, section.as_str(), lines.len());
        for (idx, line) in lines.iter().enumerate() {
            let Some((name, body)) = parse_key_value(line) else {
                continue;
            };
            if let Err(e) = library.define(&name, &body, address.at_line(idx)) {
                log.push(LogEntry::new(LogState::Warning, format!("Macro [{name}] ignored: {e}")));
            }
        }

        debug!(count = library.len(), script, section = %section, "macro library loaded");
        log.push(LogEntry::new(
            LogState::Info,
            format!("{} macro(s) loaded from [{script}]", library.len()),
        ));
        (library, log)
    }

    /// Defines or replaces macro `name` as the single command line `body`.
    pub fn define(&mut self, name: &str, body: &str, address: SectionAddress) -> Result<(), CompileError> {
        let cmd = tokenize(body, address.clone())
            .map_err(|e| CompileError::new(address, body.trim(), e))?;
        let commands = compile_commands(&[cmd])?;
        self.macros.insert(
            name.trim().to_lowercase(),
            Macro {
                name: name.trim().to_string(),
                commands: Arc::new(commands),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Macro> {
        self.macros.get(&name.trim().to_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;
    use crate::script::{Project, Script};

    fn project() -> Project {
        Project::from_scripts(vec![
            Script::parse(
                "main.script",
                "[Variables]\nAPI=lib.script\nAPIVAR=Macros\n[Process]\nSay,hi",
            ),
            Script::parse(
                "lib.script",
                "[Macros]\nSay=Echo,#1\nWhen=If,%Mode%,Equal,fast,Echo,#1\nBroken=Echo,\"x\n",
            ),
        ])
    }

    #[test]
    fn test_load_from_main_script_settings() {
        let (library, log) = MacroLibrary::load(&project(), &Variables::default());
        assert_eq!(library.len(), 2);
        let say = library.get("SAY").unwrap();
        assert!(say.commands[0].is(Opcode::Echo));
        assert_eq!(say.commands[0].operands, vec!["#1"]);
        assert!(library.get("When").unwrap().commands[0].is(Opcode::IfCompact));
        assert!(log.iter().any(|e| e.state == LogState::Warning && e.message.contains("Broken")));
    }

    #[test]
    fn test_no_api_means_empty_library() {
        let project = Project::from_scripts(vec![Script::parse("main.script", "[Process]\nEcho,x")]);
        let (library, log) = MacroLibrary::load(&project, &Variables::default());
        assert!(library.is_empty());
        assert!(log.is_empty());
    }

    #[test]
    fn test_missing_library_warns() {
        let project = Project::from_scripts(vec![Script::parse(
            "main.script",
            "[Variables]\nAPI=missing.script",
        )]);
        let (library, log) = MacroLibrary::load(&project, &Variables::default());
        assert!(library.is_empty());
        assert_eq!(log[0].state, LogState::Warning);
    }
}

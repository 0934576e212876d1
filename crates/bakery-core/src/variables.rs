//! Variable store with local, global and fixed tiers.
//!
//! Names are case-insensitive. Lookup order is local, then global, then
//! fixed. Local variables belong to the script being built and are cleared
//! between scripts; global variables live for the whole build; fixed
//! variables are set by the engine and cannot be overwritten by scripts.
//!
//! # Example
//!
//! ```
//! use bakery_core::variables::{Scope, VariableStore, Variables};
//!
//! let mut vars = Variables::default();
//! vars.set(Scope::Global, "BaseDir", "C:\\PEBakery").unwrap();
//! vars.set(Scope::Local, "Target", "%BaseDir%\\Target").unwrap();
//!
//! let out = vars.expand("%Target%\\a.txt").unwrap();
//! assert_eq!(out.text, "C:\\PEBakery\\Target\\a.txt");
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ExpandError, VariableError};
use crate::expand::{expand_variables, variable_refs};
use crate::script::parse_key_value;

/// Upper bound on re-expansion rounds for nested variable values.
const MAX_NESTED_ROUNDS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Local,
    Global,
    Fixed,
}

/// What an undefined `%Name%` expands to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UndefinedPolicy {
    /// Empty string.
    #[default]
    Empty,
    /// The `%Name%` reference itself.
    Literal,
}

/// Result of expanding one operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub text: String,
    /// Names that were referenced but not defined.
    pub undefined: Vec<String>,
}

/// Variable lookup and mutation as seen by the execution driver.
pub trait VariableStore {
    /// Fully resolved value of `name`, nested references included.
    fn get(&self, name: &str) -> Option<String>;

    fn set(&mut self, scope: Scope, name: &str, value: &str) -> Result<(), VariableError>;

    /// Removes `name` from `scope`. Returns whether it existed.
    fn remove(&mut self, scope: Scope, name: &str) -> bool;

    /// Expands every `%Name%` in `text` in one pass.
    fn expand(&self, text: &str) -> Result<Expansion, ExpandError>;

    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Default)]
pub struct Variables {
    local: HashMap<String, Entry>,
    global: HashMap<String, Entry>,
    fixed: HashMap<String, Entry>,
    policy: UndefinedPolicy,
}

/// `%Name%` to `Name`. Returns `None` when `text` is not a single reference.
pub fn strip_percent(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix('%')?.strip_suffix('%')?;
    (!inner.is_empty() && !inner.contains('%')).then_some(inner)
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

impl Variables {
    pub fn new(policy: UndefinedPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> UndefinedPolicy {
        self.policy
    }

    fn tier(&self, scope: Scope) -> &HashMap<String, Entry> {
        match scope {
            Scope::Local => &self.local,
            Scope::Global => &self.global,
            Scope::Fixed => &self.fixed,
        }
    }

    fn tier_mut(&mut self, scope: Scope) -> &mut HashMap<String, Entry> {
        match scope {
            Scope::Local => &mut self.local,
            Scope::Global => &mut self.global,
            Scope::Fixed => &mut self.fixed,
        }
    }

    /// Stored value without nested expansion.
    pub fn get_raw(&self, name: &str) -> Option<&str> {
        let key = key(name);
        [Scope::Local, Scope::Global, Scope::Fixed]
            .into_iter()
            .find_map(|scope| self.tier(scope).get(&key))
            .map(|entry| entry.value.as_str())
    }

    /// Stored value in one specific tier.
    pub fn get_in(&self, scope: Scope, name: &str) -> Option<&str> {
        self.tier(scope).get(&key(name)).map(|entry| entry.value.as_str())
    }

    pub fn clear_local(&mut self) {
        self.local.clear();
    }

    /// Names and raw values in one tier, sorted by name.
    pub fn list(&self, scope: Scope) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .tier(scope)
            .values()
            .map(|entry| (entry.name.clone(), entry.value.clone()))
            .collect();
        out.sort_by_key(|(name, _)| name.to_lowercase());
        out
    }

    /// Imports `Name=Value` lines into `scope`.
    ///
    /// Lines that are not key-value pairs are skipped. Each accepted line
    /// reports its own outcome so the caller can log it.
    pub fn add_variables(
        &mut self,
        scope: Scope,
        lines: &[String],
    ) -> Vec<Result<(String, String), VariableError>> {
        lines
            .iter()
            .filter_map(|line| parse_key_value(line))
            .map(|(name, value)| {
                let name = strip_percent(&name).map(str::to_string).unwrap_or(name);
                self.set(scope, &name, &value).map(|()| (name, value))
            })
            .collect()
    }
}

impl VariableStore for Variables {
    fn get(&self, name: &str) -> Option<String> {
        let mut value = self.get_raw(name)?.to_string();
        for _ in 0..MAX_NESTED_ROUNDS {
            if !value.contains('%') {
                break;
            }
            let next = match expand_variables(
                &value,
                |n| self.get_raw(n).map(str::to_string),
                |n| format!("%{n}%"),
            ) {
                Ok(next) => next,
                Err(_) => break,
            };
            if next == value {
                break;
            }
            value = next;
        }
        Some(value)
    }

    fn set(&mut self, scope: Scope, name: &str, value: &str) -> Result<(), VariableError> {
        let name = name.trim();
        if name.is_empty() || name.contains('%') {
            return Err(VariableError::InvalidName(name.to_string()));
        }
        let key = key(name);
        if scope != Scope::Fixed && self.fixed.contains_key(&key) {
            return Err(VariableError::ReadOnly(name.to_string()));
        }
        if variable_refs(value).iter().any(|r| r.eq_ignore_ascii_case(name)) {
            return Err(VariableError::CircularReference(name.to_string()));
        }
        self.tier_mut(scope).insert(
            key,
            Entry {
                name: name.to_string(),
                value: value.to_string(),
            },
        );
        Ok(())
    }

    fn remove(&mut self, scope: Scope, name: &str) -> bool {
        self.tier_mut(scope).remove(&key(name)).is_some()
    }

    fn expand(&self, text: &str) -> Result<Expansion, ExpandError> {
        let mut undefined = Vec::new();
        let policy = self.policy;
        let text = expand_variables(
            text,
            |name| self.get(name),
            |name| {
                warn!(variable = name, "undefined variable");
                undefined.push(name.to_string());
                match policy {
                    UndefinedPolicy::Empty => String::new(),
                    UndefinedPolicy::Literal => format!("%{name}%"),
                }
            },
        )?;
        Ok(Expansion { text, undefined })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_case_insensitive() {
        let mut vars = Variables::default();
        vars.set(Scope::Local, "BaseDir", "x").unwrap();
        assert_eq!(vars.get("basedir").as_deref(), Some("x"));
        assert!(vars.contains("BASEDIR"));
    }

    #[test]
    fn test_local_shadows_global() {
        let mut vars = Variables::default();
        vars.set(Scope::Global, "A", "global").unwrap();
        vars.set(Scope::Local, "A", "local").unwrap();
        assert_eq!(vars.get("A").as_deref(), Some("local"));
        vars.clear_local();
        assert_eq!(vars.get("A").as_deref(), Some("global"));
    }

    #[test]
    fn test_fixed_is_read_only() {
        let mut vars = Variables::default();
        vars.set(Scope::Fixed, "ProjectDir", "/p").unwrap();
        match vars.set(Scope::Local, "projectdir", "/q") {
            Err(VariableError::ReadOnly(_)) => {}
            other => panic!("Expected ReadOnly, got {other:?}"),
        }
    }

    #[test]
    fn test_circular_reference_rejected() {
        let mut vars = Variables::default();
        match vars.set(Scope::Local, "A", "x%a%y") {
            Err(VariableError::CircularReference(name)) => assert_eq!(name, "A"),
            other => panic!("Expected CircularReference, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_name_rejected() {
        let mut vars = Variables::default();
        assert!(vars.set(Scope::Local, "", "x").is_err());
        assert!(vars.set(Scope::Local, "%A%", "x").is_err());
    }

    #[test]
    fn test_nested_values_resolve() {
        let mut vars = Variables::default();
        vars.set(Scope::Global, "Root", "C:\\Build").unwrap();
        vars.set(Scope::Local, "Target", "%Root%\\Target").unwrap();
        vars.set(Scope::Local, "Out", "%Target%\\out").unwrap();
        assert_eq!(vars.get("Out").as_deref(), Some("C:\\Build\\Target\\out"));
    }

    #[test]
    fn test_mutual_reference_terminates() {
        let mut vars = Variables::default();
        vars.set(Scope::Local, "A", "%B%").unwrap();
        vars.set(Scope::Local, "B", "%A%").unwrap();
        assert!(vars.get("A").is_some());
    }

    #[test]
    fn test_expand_undefined_empty() {
        let mut vars = Variables::default();
        vars.set(Scope::Local, "BaseDir", "C:\\PEBakery").unwrap();
        let out = vars.expand("%BaseDir%\\a.txt").unwrap();
        assert_eq!(out.text, "C:\\PEBakery\\a.txt");
        assert!(out.undefined.is_empty());

        let out = vars.expand("x%Undefined%y").unwrap();
        assert_eq!(out.text, "xy");
        assert_eq!(out.undefined, vec!["Undefined"]);
    }

    #[test]
    fn test_expand_undefined_literal() {
        let vars = Variables::new(UndefinedPolicy::Literal);
        let out = vars.expand("x%Undefined%y").unwrap();
        assert_eq!(out.text, "x%Undefined%y");
        assert_eq!(out.undefined.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut vars = Variables::default();
        vars.set(Scope::Global, "A", "1").unwrap();
        assert!(!vars.remove(Scope::Local, "A"));
        assert!(vars.remove(Scope::Global, "a"));
        assert!(!vars.contains("A"));
    }

    #[test]
    fn test_add_variables() {
        let mut vars = Variables::default();
        let lines = vec![
            "%Title%=Demo".to_string(),
            "Version=1.0".to_string(),
            "// comment".to_string(),
            "%Loop%=%Loop%".to_string(),
        ];
        let results = vars.add_variables(Scope::Local, &lines);
        assert_eq!(results.len(), 3);
        assert!(results[2].is_err());
        assert_eq!(vars.get("Title").as_deref(), Some("Demo"));
        assert_eq!(vars.get("Version").as_deref(), Some("1.0"));
    }

    #[test]
    fn test_strip_percent() {
        assert_eq!(strip_percent("%A%"), Some("A"));
        assert_eq!(strip_percent(" %A% "), Some("A"));
        assert_eq!(strip_percent("A"), None);
        assert_eq!(strip_percent("%%"), None);
        assert_eq!(strip_percent("%A%B%"), None);
    }
}

//! Evaluation of `If` conditions.
//!
//! Comparisons are numeric when both sides parse as numbers (decimal,
//! `0x` hexadecimal or fractional) and case-insensitive string equality
//! otherwise; ordering comparators on non-numeric text are false. Probes
//! check the file system, the project, the variable store, the macro library
//! or a [`RegistryProbe`].

use std::cmp::Ordering;
use std::path::Path;

use crate::condition::{Condition, PredicateKind};
use crate::error::ExecError;
use crate::macros::MacroLibrary;
use crate::script::{ini_has_section, SectionRepository};
use crate::variables::{strip_percent, VariableStore, Variables};

/// Registry access used by `ExistRegSection` and `ExistRegKey`.
pub trait RegistryProbe {
    fn key_exists(&self, root: &str, sub_key: &str) -> Result<bool, String>;
    fn value_exists(&self, root: &str, sub_key: &str, value: &str) -> Result<bool, String>;
}

/// Probe for hosts without a registry: every query fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRegistry;

impl RegistryProbe for NoRegistry {
    fn key_exists(&self, _root: &str, _sub_key: &str) -> Result<bool, String> {
        Err("registry is not available on this platform".to_string())
    }

    fn value_exists(&self, _root: &str, _sub_key: &str, _value: &str) -> Result<bool, String> {
        Err("registry is not available on this platform".to_string())
    }
}

/// Everything a condition may look at.
pub struct Probes<'a> {
    pub variables: &'a Variables,
    pub macros: &'a MacroLibrary,
    pub repo: &'a dyn SectionRepository,
    pub registry: &'a dyn RegistryProbe,
}

/// Outcome of a condition, negation applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub matched: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i64),
    Float(f64),
}

fn parse_number(text: &str) -> Option<Number> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        let value = i64::from_str_radix(hex, 16).ok()?;
        return Some(Number::Int(if negative { -value } else { value }));
    }
    if let Ok(value) = text.parse::<i64>() {
        return Some(Number::Int(value));
    }
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && !text.contains(|c: char| c.is_ascii_alphabetic()))
        .map(Number::Float)
}

/// Compares two operand values.
///
/// Returns `None` for text that is not equal and cannot be ordered.
pub fn compare_values(left: &str, right: &str) -> Option<Ordering> {
    match (parse_number(left), parse_number(right)) {
        (Some(Number::Int(a)), Some(Number::Int(b))) => Some(a.cmp(&b)),
        (Some(a), Some(b)) => {
            let a = match a {
                Number::Int(v) => v as f64,
                Number::Float(v) => v,
            };
            let b = match b {
                Number::Int(v) => v as f64,
                Number::Float(v) => v,
            };
            a.partial_cmp(&b)
        }
        _ if left.eq_ignore_ascii_case(right) => Some(Ordering::Equal),
        _ => None,
    }
}

fn has_wildcard(path: &str) -> bool {
    path.contains(['*', '?'])
}

fn path_exists(path: &str, want_dir: bool) -> bool {
    let matches_kind = |p: &Path| if want_dir { p.is_dir() } else { p.is_file() };
    if has_wildcard(path) {
        glob::glob(path)
            .map(|mut paths| paths.any(|p| p.is_ok_and(|p| matches_kind(&p))))
            .unwrap_or(false)
    } else {
        matches_kind(Path::new(path))
    }
}

/// Evaluates `condition` against already expanded `args`.
///
/// `ExistVar` and `ExistMacro` expect their raw, unexpanded name.
pub fn evaluate(condition: &Condition, args: &[String], probes: &Probes<'_>) -> Result<Verdict, ExecError> {
    let arg = |idx: usize| args.get(idx).map(String::as_str).unwrap_or("");
    let kind = condition.predicate;

    let (raw, message) = match kind {
        PredicateKind::Equal
        | PredicateKind::Smaller
        | PredicateKind::Bigger
        | PredicateKind::SmallerEqual
        | PredicateKind::BiggerEqual => {
            let (left, right) = (arg(0), arg(1));
            let ordering = compare_values(left, right);
            let matched = match kind {
                PredicateKind::Equal => ordering == Some(Ordering::Equal),
                PredicateKind::Smaller => ordering == Some(Ordering::Less),
                PredicateKind::Bigger => ordering == Some(Ordering::Greater),
                PredicateKind::SmallerEqual => {
                    matches!(ordering, Some(Ordering::Less | Ordering::Equal))
                }
                _ => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            };
            (matched, format!("[{left}] {kind} [{right}]"))
        }
        PredicateKind::EqualX => {
            let (left, right) = (arg(0), arg(1));
            (left == right, format!("[{left}] {kind} [{right}]"))
        }
        PredicateKind::ExistFile => (path_exists(arg(0), false), format!("File [{}] exists", arg(0))),
        PredicateKind::ExistDir => (path_exists(arg(0), true), format!("Directory [{}] exists", arg(0))),
        PredicateKind::ExistSection => {
            let (file, section) = (arg(0), arg(1));
            let found = match probes.repo.resolve_script(file) {
                Some(script) => probes.repo.get_section(script, section).is_some(),
                None if Path::new(file).is_file() => {
                    ini_has_section(Path::new(file), section).map_err(|e| ExecError::Failed(e.to_string()))?
                }
                None => false,
            };
            (found, format!("Section [{section}] exists in [{file}]"))
        }
        PredicateKind::ExistRegSection => {
            let found = probes
                .registry
                .key_exists(arg(0), arg(1))
                .map_err(ExecError::Failed)?;
            (found, format!("Registry key [{}\\{}] exists", arg(0), arg(1)))
        }
        PredicateKind::ExistRegKey => {
            let found = probes
                .registry
                .value_exists(arg(0), arg(1), arg(2))
                .map_err(ExecError::Failed)?;
            (
                found,
                format!("Registry value [{}\\{}\\{}] exists", arg(0), arg(1), arg(2)),
            )
        }
        PredicateKind::ExistVar => {
            let name = strip_percent(arg(0)).unwrap_or(arg(0));
            (probes.variables.contains(name), format!("Variable [%{name}%] exists"))
        }
        PredicateKind::ExistMacro => {
            let name = arg(0).trim();
            (probes.macros.contains(name), format!("Macro [{name}] exists"))
        }
        PredicateKind::Ping | PredicateKind::Online => {
            return Err(ExecError::NotImplemented(format!("If,{kind}")));
        }
    };

    let matched = raw != condition.negate;
    let message = if condition.negate {
        format!("Not {message}: {matched}")
    } else {
        format!("{message}: {matched}")
    };
    Ok(Verdict { matched, message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Project, Script};
    use crate::variables::Scope;

    fn cond(predicate: PredicateKind, negate: bool) -> Condition {
        Condition {
            predicate,
            operands: Vec::new(),
            negate,
        }
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    struct Fixture {
        vars: Variables,
        macros: MacroLibrary,
        project: Project,
    }

    impl Fixture {
        fn new() -> Self {
            let mut vars = Variables::default();
            vars.set(Scope::Local, "Known", "1").unwrap();
            Self {
                vars,
                macros: MacroLibrary::new(),
                project: Project::from_scripts(vec![Script::parse("a.script", "[Main]\n[Process]")]),
            }
        }

        fn check(&self, condition: &Condition, values: &[&str]) -> Result<Verdict, ExecError> {
            let probes = Probes {
                variables: &self.vars,
                macros: &self.macros,
                repo: &self.project,
                registry: &NoRegistry,
            };
            evaluate(condition, &args(values), &probes)
        }
    }

    #[test]
    fn test_numeric_comparison() {
        assert_eq!(compare_values("10", "9"), Some(Ordering::Greater));
        assert_eq!(compare_values("0x10", "16"), Some(Ordering::Equal));
        assert_eq!(compare_values("1.5", "2"), Some(Ordering::Less));
        assert_eq!(compare_values("-3", "2"), Some(Ordering::Less));
    }

    #[test]
    fn test_string_comparison() {
        assert_eq!(compare_values("Hello", "hello"), Some(Ordering::Equal));
        assert_eq!(compare_values("abc", "abd"), None);
        assert_eq!(compare_values("inf", "inf"), Some(Ordering::Equal));
    }

    #[test]
    fn test_comparators() {
        let f = Fixture::new();
        assert!(f.check(&cond(PredicateKind::Equal, false), &["B", "b"]).unwrap().matched);
        assert!(!f.check(&cond(PredicateKind::EqualX, false), &["B", "b"]).unwrap().matched);
        assert!(f.check(&cond(PredicateKind::Smaller, false), &["2", "10"]).unwrap().matched);
        assert!(f.check(&cond(PredicateKind::BiggerEqual, false), &["10", "10"]).unwrap().matched);
        assert!(!f.check(&cond(PredicateKind::Bigger, false), &["a", "b"]).unwrap().matched);
    }

    #[test]
    fn test_negation_applied_after_evaluation() {
        let f = Fixture::new();
        let verdict = f.check(&cond(PredicateKind::Equal, true), &["A", "B"]).unwrap();
        assert!(verdict.matched);
        assert!(verdict.message.starts_with("Not"));
    }

    #[test]
    fn test_exist_var_and_macro() {
        let f = Fixture::new();
        assert!(f.check(&cond(PredicateKind::ExistVar, false), &["%Known%"]).unwrap().matched);
        assert!(!f.check(&cond(PredicateKind::ExistVar, false), &["%Nope%"]).unwrap().matched);
        assert!(!f.check(&cond(PredicateKind::ExistMacro, false), &["Say"]).unwrap().matched);
    }

    #[test]
    fn test_exist_section_in_project() {
        let f = Fixture::new();
        assert!(f.check(&cond(PredicateKind::ExistSection, false), &["a.script", "process"]).unwrap().matched);
        assert!(!f.check(&cond(PredicateKind::ExistSection, false), &["a.script", "Other"]).unwrap().matched);
    }

    #[test]
    fn test_exist_file_and_dir() {
        let dir = std::env::temp_dir().join(format!("bakery-pred-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("a.txt");
        std::fs::write(&file, "x").unwrap();

        let f = Fixture::new();
        let file_str = file.display().to_string();
        let dir_str = dir.display().to_string();
        assert!(f.check(&cond(PredicateKind::ExistFile, false), &[file_str.as_str()]).unwrap().matched);
        assert!(!f.check(&cond(PredicateKind::ExistFile, false), &[dir_str.as_str()]).unwrap().matched);
        assert!(f.check(&cond(PredicateKind::ExistDir, false), &[dir_str.as_str()]).unwrap().matched);
        let pattern = format!("{}/*.txt", dir_str);
        assert!(f.check(&cond(PredicateKind::ExistFile, false), &[pattern.as_str()]).unwrap().matched);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_registry_and_network_are_recoverable_errors() {
        let f = Fixture::new();
        let err = f
            .check(&cond(PredicateKind::ExistRegKey, false), &["HKLM", "Software", "X"])
            .unwrap_err();
        assert!(!err.is_critical());
        let err = f.check(&cond(PredicateKind::Online, false), &[]).unwrap_err();
        assert!(matches!(err, ExecError::NotImplemented(_)));
    }
}

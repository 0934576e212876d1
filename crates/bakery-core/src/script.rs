//! Script files and the project that holds them.
//!
//! A script is an ini-style file: `[Section]` headers followed by raw lines.
//! Code sections are compiled on demand by the engine; data sections such as
//! `[Variables]` are read as `Name=Value` pairs.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ProjectError;

/// Name of the section holding a script's variables.
pub const VARIABLES_SECTION: &str = "Variables";

/// Read access to script sections, as used by the execution driver.
pub trait SectionRepository {
    /// Raw lines of `section` in `script`.
    fn get_section(&self, script: &str, section: &str) -> Option<&[String]>;

    /// Script ids in build order. The first one is the main script.
    fn scripts(&self) -> Vec<&str>;

    /// Maps a script reference (id, path or file name) to a script id.
    fn resolve_script(&self, reference: &str) -> Option<&str>;

    fn main_script(&self) -> Option<&str> {
        self.scripts().first().copied()
    }
}

/// Splits `Name=Value`. Blank lines, comments and lines without `=` yield `None`.
pub fn parse_key_value(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("//") || line.starts_with('#') || line.starts_with(';') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

fn section_header(line: &str) -> Option<&str> {
    let name = line.trim().strip_prefix('[')?.strip_suffix(']')?.trim();
    (!name.is_empty()).then_some(name)
}

/// True when the ini file at `path` has a `[name]` section.
pub fn ini_has_section(path: &Path, name: &str) -> Result<bool, ProjectError> {
    let text = fs::read_to_string(path).map_err(|source| ProjectError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(text
        .lines()
        .filter_map(section_header)
        .any(|header| header.eq_ignore_ascii_case(name)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Script {
    id: String,
    path: Option<PathBuf>,
    sections: Vec<Section>,
}

impl Script {
    /// Parses script text. Lines before the first header are ignored; a
    /// repeated header appends to the earlier section.
    pub fn parse(id: impl Into<String>, text: &str) -> Self {
        let mut sections: Vec<Section> = Vec::new();
        let mut current: Option<usize> = None;

        for line in text.lines() {
            if let Some(name) = section_header(line) {
                let idx = match sections.iter().position(|s| s.name.eq_ignore_ascii_case(name)) {
                    Some(idx) => idx,
                    None => {
                        sections.push(Section {
                            name: name.to_string(),
                            lines: Vec::new(),
                        });
                        sections.len() - 1
                    }
                };
                current = Some(idx);
            } else if let Some(idx) = current {
                sections[idx].lines.push(line.to_string());
            }
        }

        Self {
            id: id.into(),
            path: None,
            sections,
        }
    }

    pub fn load(path: &Path, id: impl Into<String>) -> Result<Self, ProjectError> {
        let text = fs::read_to_string(path).map_err(|source| ProjectError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut script = Self::parse(id, &text);
        script.path = Some(path.to_path_buf());
        Ok(script)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name.eq_ignore_ascii_case(name.trim()))
    }

    fn matches(&self, reference: &str) -> bool {
        let reference = normalize(reference);
        if normalize(&self.id).eq_ignore_ascii_case(&reference) {
            return true;
        }
        self.path
            .as_deref()
            .is_some_and(|p| normalize(&p.display().to_string()).eq_ignore_ascii_case(&reference))
    }

    fn file_name(&self) -> &str {
        self.id.rsplit(['/', '\\']).next().unwrap_or(&self.id)
    }
}

fn normalize(path: &str) -> String {
    path.trim().replace('\\', "/")
}

/// An ordered collection of scripts. The first script is the main script.
#[derive(Debug, Clone, Default)]
pub struct Project {
    root: Option<PathBuf>,
    scripts: Vec<Script>,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_scripts(scripts: Vec<Script>) -> Self {
        Self { root: None, scripts }
    }

    pub fn push(&mut self, script: Script) {
        self.scripts.push(script);
    }

    /// Loads every `*.<extension>` file under `dir`, sorted by relative path.
    ///
    /// A top-level `main.<extension>` is moved to the front.
    pub fn load_dir(dir: &Path, extension: &str) -> Result<Self, ProjectError> {
        let pattern = format!(
            "{}/**/*.{}",
            glob::Pattern::escape(&dir.display().to_string()),
            extension
        );
        let mut paths = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|e| ProjectError::Io {
                path: e.path().display().to_string(),
                source: e.into(),
            })?;
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let main_name = format!("main.{extension}");
        if let Some(pos) = paths.iter().position(|p| {
            p.parent() == Some(dir) && p.file_name().is_some_and(|n| n.eq_ignore_ascii_case(&main_name))
        }) {
            let main = paths.remove(pos);
            paths.insert(0, main);
        }

        if paths.is_empty() {
            return Err(ProjectError::Empty(dir.display().to_string()));
        }

        let mut scripts = Vec::with_capacity(paths.len());
        for path in &paths {
            let id = path
                .strip_prefix(dir)
                .unwrap_or(path)
                .display()
                .to_string()
                .replace('\\', "/");
            debug!(script = %id, "loading script");
            scripts.push(Script::load(path, id)?);
        }

        Ok(Self {
            root: Some(dir.to_path_buf()),
            scripts,
        })
    }

    /// Loads the given files in order, each identified by its path as given.
    pub fn load_files(paths: &[PathBuf]) -> Result<Self, ProjectError> {
        let scripts = paths
            .iter()
            .map(|path| Script::load(path, path.display().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        let root = paths.first().and_then(|p| p.parent()).map(Path::to_path_buf);
        Ok(Self { root, scripts })
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn all_scripts(&self) -> &[Script] {
        &self.scripts
    }

    pub fn script(&self, id: &str) -> Option<&Script> {
        self.scripts.iter().find(|s| s.id == id)
    }
}

impl SectionRepository for Project {
    fn get_section(&self, script: &str, section: &str) -> Option<&[String]> {
        self.script(script)?.section(section).map(|s| s.lines.as_slice())
    }

    fn scripts(&self) -> Vec<&str> {
        self.scripts.iter().map(|s| s.id.as_str()).collect()
    }

    fn resolve_script(&self, reference: &str) -> Option<&str> {
        if let Some(script) = self.scripts.iter().find(|s| s.matches(reference)) {
            return Some(&script.id);
        }
        if let Some(root) = &self.root {
            let relative = normalize(reference);
            let root = normalize(&root.display().to_string());
            if let Some(stripped) = relative.strip_prefix(&format!("{root}/")) {
                if let Some(script) = self.scripts.iter().find(|s| s.matches(stripped)) {
                    return Some(&script.id);
                }
            }
        }
        let name = normalize(reference);
        let name = name.rsplit('/').next().unwrap_or(&name);
        self.scripts
            .iter()
            .find(|s| s.file_name().eq_ignore_ascii_case(name))
            .map(|s| s.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
; preamble is ignored
[Main]
Title=Sample
[Variables]
%Dest%=C:\\Out

[Process]
Echo,Hello
If,%A%,Equal,B,Begin
  Echo,Inside
End
";

    #[test]
    fn test_parse_sections() {
        let script = Script::parse("sample.script", SAMPLE);
        let names: Vec<&str> = script.sections().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Main", "Variables", "Process"]);

        let process = script.section("process").unwrap();
        assert_eq!(process.lines[0], "Echo,Hello");
        assert_eq!(process.lines[2], "  Echo,Inside");
    }

    #[test]
    fn test_repeated_header_appends() {
        let script = Script::parse("s", "[A]\nx\n[B]\ny\n[a]\nz");
        assert_eq!(script.section("A").unwrap().lines, vec!["x", "z"]);
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value(" Key = Value=1 "),
            Some(("Key".to_string(), "Value=1".to_string()))
        );
        assert_eq!(parse_key_value("// Key=Value"), None);
        assert_eq!(parse_key_value("NoEquals"), None);
        assert_eq!(parse_key_value("=orphan"), None);
    }

    #[test]
    fn test_repository_lookup() {
        let project = Project::from_scripts(vec![
            Script::parse("main.script", "[Process]\nEcho,main"),
            Script::parse("apps/tool.script", "[Process]\nEcho,tool"),
        ]);
        assert_eq!(project.main_script(), Some("main.script"));
        assert_eq!(
            project.get_section("apps/tool.script", "PROCESS").map(|l| l.len()),
            Some(1)
        );
        assert!(project.get_section("apps/tool.script", "Missing").is_none());
        assert_eq!(project.resolve_script("apps\\tool.script"), Some("apps/tool.script"));
        assert_eq!(project.resolve_script("TOOL.script"), Some("apps/tool.script"));
        assert_eq!(project.resolve_script("other.script"), None);
    }
}

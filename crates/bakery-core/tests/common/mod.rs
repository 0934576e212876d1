//! Shared helpers for bakery-core integration tests.
//!
//! Projects are built in memory from `(id, text)` pairs; the first script is
//! the main script. Tests that need files on disk get a unique directory
//! under the system temp dir.

#![allow(dead_code)]

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use bakery_core::config::EngineConfig;
use bakery_core::engine::{Engine, HandlerCall};
use bakery_core::error::ExecError;
use bakery_core::logger::{LogState, MemoryLogger};
use bakery_core::opcode::Opcode;
use bakery_core::script::{Project, Script};

pub fn project(scripts: &[(&str, &str)]) -> Project {
    Project::from_scripts(
        scripts
            .iter()
            .map(|(id, text)| Script::parse(*id, text))
            .collect(),
    )
}

/// Single-script project named `main.script`.
pub fn single(text: &str) -> Project {
    project(&[("main.script", text)])
}

/// Runs a full build and returns the log, panicking on a critical error.
pub fn build(project: &Project) -> MemoryLogger {
    build_with(project, EngineConfig::default())
}

pub fn build_with(project: &Project, config: EngineConfig) -> MemoryLogger {
    let mut engine = Engine::new(project, config);
    if let Err(e) = engine.build() {
        panic!("build failed: {e}\n{}", engine.logger().render());
    }
    engine.into_logger()
}

/// Runs a build that is expected to stop on a critical error.
pub fn build_err(project: &Project, config: EngineConfig) -> (ExecError, MemoryLogger) {
    let mut engine = Engine::new(project, config);
    match engine.build() {
        Err(e) => (e, engine.into_logger()),
        Ok(summary) => panic!("Expected build to fail, got {summary:?}"),
    }
}

pub fn success(log: &MemoryLogger) -> Vec<String> {
    log.messages(LogState::Success).into_iter().map(String::from).collect()
}

pub type Calls = Rc<RefCell<Vec<Vec<String>>>>;

/// Registers a handler for `op` that records its expanded arguments.
pub fn capture(engine: &mut Engine<'_>, op: Opcode) -> Calls {
    let calls: Calls = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&calls);
    engine.register(op, move |call: HandlerCall<'_>| -> Result<String, ExecError> {
        sink.borrow_mut().push(call.args.to_vec());
        Ok(format!("[{}] handled", call.cmd.opcode))
    });
    calls
}

/// Creates a fresh directory holding `files` (relative path, content).
pub fn temp_project(files: &[(&str, &str)]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("bakery-test-{}", uuid::Uuid::new_v4()));
    for (path, content) in files {
        let target = dir.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(target, content).unwrap();
    }
    dir
}

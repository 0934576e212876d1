//! Execution driver.
//!
//! The [`Engine`] walks compiled command trees. Sections are compiled on
//! first use and cached, failures included. Every operand is expanded right
//! before dispatch: positional parameters, then variables, then escape
//! sequences.
//!
//! # Error handling
//!
//! A failing instruction is logged and execution moves on to the next one.
//! `System,ErrorOff,N` downgrades the next `N` failures to [`LogState::Muted`].
//! Critical errors (a section that fails to compile, call depth overflow,
//! `Halt`) unwind the whole build.
//!
//! # Example
//!
//! ```
//! use bakery_core::config::EngineConfig;
//! use bakery_core::engine::Engine;
//! use bakery_core::logger::LogState;
//! use bakery_core::script::{Project, Script};
//!
//! let project = Project::from_scripts(vec![Script::parse(
//!     "main.script",
//!     "[Process]\nSet,%Name%,World\nEcho,Hello %Name%",
//! )]);
//! let mut engine = Engine::new(&project, EngineConfig::default());
//! engine.build().unwrap();
//!
//! assert!(engine.logger().messages(LogState::Success).contains(&"Hello World"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::command::{Command, SectionAddress};
use crate::compiler::compile_section;
use crate::condition::{Condition, PredicateKind};
use crate::config::EngineConfig;
use crate::error::{CompileError, ExecError};
use crate::escape::unescape;
use crate::expand::expand_params;
use crate::logger::{BuildLogger, LogEntry, LogState, MemoryLogger};
use crate::macros::MacroLibrary;
use crate::opcode::{Opcode, OpcodeTag};
use crate::predicate::{evaluate, NoRegistry, Probes, RegistryProbe, Verdict};
use crate::script::{SectionRepository, VARIABLES_SECTION};
use crate::variables::{strip_percent, Scope, VariableStore, Variables};

/// How control leaves a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Flow {
    Continue,
    /// `Loop,BREAK`: stop the innermost loop.
    Break,
    /// `Exit`: stop the current script.
    Exit,
}

/// Per-invocation state of a running section.
///
/// Each `Run`/`Exec`/`Loop` call gets a child context with its own
/// parameters; the variable store is shared through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub script: String,
    pub section: String,
    /// Positional parameters; `#1` is `params[0]`.
    pub params: Vec<String>,
    /// Log indentation of the section's top-level commands.
    pub depth: usize,
    /// Value of `#c` inside a `Loop` iteration.
    pub loop_counter: Option<i64>,
}

impl ExecutionContext {
    pub fn new(script: impl Into<String>, section: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            script: script.into(),
            section: section.into(),
            params,
            depth: 0,
            loop_counter: None,
        }
    }

    pub fn child(&self, script: String, section: String, params: Vec<String>, depth: usize) -> Self {
        Self {
            script,
            section,
            params,
            depth,
            loop_counter: None,
        }
    }

    /// 1-based parameter lookup.
    pub fn param(&self, index: usize) -> Option<&str> {
        index.checked_sub(1).and_then(|i| self.params.get(i)).map(String::as_str)
    }

    /// 1-based parameter write; missing parameters in between become empty.
    pub fn set_param(&mut self, index: usize, value: String) {
        if index == 0 {
            return;
        }
        if self.params.len() < index {
            self.params.resize(index, String::new());
        }
        self.params[index - 1] = value;
    }
}

/// Arguments handed to a [`CommandHandler`].
pub struct HandlerCall<'a> {
    pub cmd: &'a Command,
    /// Fully expanded operands.
    pub args: &'a [String],
    pub variables: &'a mut Variables,
}

/// Implementation of a built-in opcode whose behavior lives outside the engine.
///
/// Returns the message logged on success.
pub trait CommandHandler {
    fn execute(&mut self, call: HandlerCall<'_>) -> Result<String, ExecError>;
}

impl<F> CommandHandler for F
where
    F: FnMut(HandlerCall<'_>) -> Result<String, ExecError>,
{
    fn execute(&mut self, call: HandlerCall<'_>) -> Result<String, ExecError> {
        self(call)
    }
}

/// Totals of a finished build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub build_id: Uuid,
    pub scripts: usize,
    pub errors: usize,
    pub warnings: usize,
}

/// Result of running a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockOutcome {
    flow: Flow,
    /// Whether an `ElseCompact` following this list's last node would run.
    else_armed: bool,
}

impl BlockOutcome {
    const CONTINUE: Self = Self {
        flow: Flow::Continue,
        else_armed: false,
    };
}

type CompiledSection = Result<Arc<Vec<Command>>, CompileError>;

pub struct Engine<'p, L: BuildLogger = MemoryLogger> {
    repo: &'p dyn SectionRepository,
    config: EngineConfig,
    variables: Variables,
    macros: MacroLibrary,
    macros_loaded: bool,
    registry: Box<dyn RegistryProbe>,
    handlers: HashMap<Opcode, Box<dyn CommandHandler>>,
    compiled: HashMap<(String, String), CompiledSection>,
    logger: L,
    build_id: Uuid,
    call_depth: usize,
    error_off: usize,
    log_suspended: bool,
    errors: usize,
    warnings: usize,
}

impl<'p> Engine<'p, MemoryLogger> {
    pub fn new(repo: &'p dyn SectionRepository, config: EngineConfig) -> Self {
        let logger = MemoryLogger::new(config.log_capacity);
        Self::with_logger(repo, config, logger)
    }
}

impl<'p, L: BuildLogger> Engine<'p, L> {
    pub fn with_logger(repo: &'p dyn SectionRepository, config: EngineConfig, logger: L) -> Self {
        Self {
            repo,
            variables: Variables::new(config.undefined_variables),
            config,
            macros: MacroLibrary::new(),
            macros_loaded: false,
            registry: Box::new(NoRegistry),
            handlers: HashMap::new(),
            compiled: HashMap::new(),
            logger,
            build_id: Uuid::new_v4(),
            call_depth: 0,
            error_off: 0,
            log_suspended: false,
            errors: 0,
            warnings: 0,
        }
    }

    pub fn with_registry(mut self, registry: impl RegistryProbe + 'static) -> Self {
        self.registry = Box::new(registry);
        self
    }

    /// Installs `handler` for `op`. Control opcodes (`Run`, `Set`, `If`, ...)
    /// always use the engine's own implementation.
    pub fn register(&mut self, op: Opcode, handler: impl CommandHandler + 'static) {
        self.handlers.insert(op, Box::new(handler));
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    pub fn macros(&self) -> &MacroLibrary {
        &self.macros
    }

    pub fn logger(&self) -> &L {
        &self.logger
    }

    pub fn into_logger(self) -> L {
        self.logger
    }

    pub fn build_id(&self) -> Uuid {
        self.build_id
    }

    fn log(&mut self, entry: LogEntry) {
        match entry.state {
            LogState::Error => self.errors += 1,
            LogState::Warning => self.warnings += 1,
            _ => {}
        }
        if self.log_suspended && !matches!(entry.state, LogState::Error | LogState::Warning) {
            return;
        }
        self.logger.write(entry);
    }

    fn log_cmd(&mut self, state: LogState, message: impl Into<String>, cmd: &Command, depth: usize) {
        self.log(LogEntry::for_command(state, message, cmd, depth));
    }

    /// Loads the macro library named by the main script's `[Variables]`.
    pub fn load_macros(&mut self) {
        let (macros, entries) = MacroLibrary::load(self.repo, &self.variables);
        self.macros = macros;
        self.macros_loaded = true;
        for entry in entries {
            self.log(entry);
        }
    }

    /// Runs the entry section of every script, in repository order.
    ///
    /// Stops at the first critical error.
    pub fn build(&mut self) -> Result<BuildSummary, ExecError> {
        info!(build_id = %self.build_id, "build started");
        self.log(LogEntry::new(LogState::Info, format!("Build [{}] started", self.build_id)));

        self.load_globals();

        let scripts: Vec<String> = self.repo.scripts().into_iter().map(String::from).collect();
        let mut completed = 0;
        for script in &scripts {
            if let Err(e) = self.run_script(script) {
                self.log(LogEntry::new(LogState::Error, format!("Build stopped: {e}")));
                return Err(e);
            }
            completed += 1;
        }

        let summary = BuildSummary {
            build_id: self.build_id,
            scripts: completed,
            errors: self.errors,
            warnings: self.warnings,
        };
        self.log(LogEntry::new(
            LogState::Info,
            format!(
                "Build finished: {} script(s), {} error(s), {} warning(s)",
                summary.scripts, summary.errors, summary.warnings
            ),
        ));
        Ok(summary)
    }

    /// Resets per-script state and runs the script's entry section.
    pub fn run_script(&mut self, script: &str) -> Result<Flow, ExecError> {
        self.prepare_script(script);
        let entry = self.config.section_entry.clone();
        if self.repo.get_section(script, &entry).is_none() {
            self.log(LogEntry::new(
                LogState::Info,
                format!("Script [{script}] has no [{entry}] section, skipped"),
            ));
            return Ok(Flow::Continue);
        }

        self.log(LogEntry::new(LogState::Info, format!("Processing script [{script}]")));
        let flow = self.enter_section(ExecutionContext::new(script, entry, Vec::new()))?;
        match flow {
            Flow::Exit => self.log(LogEntry::new(LogState::Info, format!("Script [{script}] exited"))),
            Flow::Break => self.log(LogEntry::new(
                LogState::Warning,
                "Loop,BREAK used outside of a loop",
            )),
            Flow::Continue => {}
        }
        Ok(flow)
    }

    /// Runs one section of one script with the given parameters.
    ///
    /// Script locals are reset first, as for a build.
    pub fn run_section(&mut self, script: &str, section: &str, params: Vec<String>) -> Result<Flow, ExecError> {
        let id = self
            .repo
            .resolve_script(script)
            .ok_or_else(|| ExecError::SectionNotFound {
                script: script.to_string(),
                section: section.to_string(),
            })?
            .to_string();
        if !self.macros_loaded {
            self.load_globals();
        }
        self.prepare_script(&id);
        self.enter_section(ExecutionContext::new(id, section, params))
    }

    /// Imports the main script's `[Variables]` as globals, then loads macros.
    fn load_globals(&mut self) {
        if let Some(main) = self.repo.main_script() {
            if let Some(lines) = self.repo.get_section(main, VARIABLES_SECTION) {
                let lines = lines.to_vec();
                self.import_variables(Scope::Global, &lines, 0);
            }
        }
        self.load_macros();
    }

    fn prepare_script(&mut self, script: &str) {
        self.variables.clear_local();
        self.error_off = 0;
        self.log_suspended = false;
        for name in ["ScriptFile", "PluginFile"] {
            if let Err(e) = self.variables.set(Scope::Local, name, script) {
                self.log(LogEntry::new(LogState::Warning, e.to_string()));
            }
        }
        if self.repo.main_script() == Some(script) {
            return;
        }
        if let Some(lines) = self.repo.get_section(script, VARIABLES_SECTION) {
            let lines = lines.to_vec();
            self.import_variables(Scope::Local, &lines, 0);
        }
    }

    fn import_variables(&mut self, scope: Scope, lines: &[String], depth: usize) {
        for result in self.variables.add_variables(scope, lines) {
            let entry = match result {
                Ok((name, value)) => {
                    debug!(name = %name, value = %value, ?scope, "variable imported");
                    continue;
                }
                Err(e) => LogEntry::new(LogState::Warning, e.to_string()),
            };
            self.log(entry.at_depth(depth));
        }
    }

    /// Compiled tree of a section, from cache when possible.
    pub fn compiled_section(&mut self, script: &str, section: &str) -> Result<Arc<Vec<Command>>, ExecError> {
        let key = (script.to_string(), section.to_lowercase());
        let result = match self.compiled.get(&key) {
            Some(cached) => cached.clone(),
            None => {
                let lines = self
                    .repo
                    .get_section(script, section)
                    .ok_or_else(|| ExecError::SectionNotFound {
                        script: script.to_string(),
                        section: section.to_string(),
                    })?;
                let address = SectionAddress::new(script, section, lines.len());
                let result = compile_section(lines, &address).map(Arc::new);
                debug!(script, section, ok = result.is_ok(), "section compiled");
                self.compiled.insert(key, result.clone());
                result
            }
        };
        result.map_err(|e| {
            self.log(LogEntry::new(LogState::Error, e.to_string()));
            ExecError::Compile(e)
        })
    }

    fn enter_section(&mut self, mut ctx: ExecutionContext) -> Result<Flow, ExecError> {
        if self.call_depth >= self.config.max_call_depth {
            let err = ExecError::CallDepth(self.config.max_call_depth);
            self.log(LogEntry::new(LogState::Error, err.to_string()).at_depth(ctx.depth));
            return Err(err);
        }
        let tree = self.compiled_section(&ctx.script, &ctx.section)?;

        self.call_depth += 1;
        let result = self.run_commands(&mut ctx, &tree);
        self.call_depth -= 1;
        result.map(|outcome| outcome.flow)
    }

    fn run_commands(&mut self, ctx: &mut ExecutionContext, cmds: &[Command]) -> Result<BlockOutcome, ExecError> {
        let mut else_armed = false;

        for cmd in cmds {
            let outcome = match cmd.builtin() {
                Some(Opcode::None | Opcode::Comment) => continue,
                Some(Opcode::IfCompact) => self.run_if(ctx, cmd)?,
                Some(Opcode::ElseCompact) => self.run_else(ctx, cmd, else_armed)?,
                _ => BlockOutcome {
                    flow: self.execute(ctx, cmd)?,
                    else_armed: false,
                },
            };
            else_armed = outcome.else_armed;
            if outcome.flow != Flow::Continue {
                return Ok(outcome);
            }
        }

        Ok(BlockOutcome {
            flow: Flow::Continue,
            else_armed,
        })
    }

    fn run_if(&mut self, ctx: &mut ExecutionContext, cmd: &Command) -> Result<BlockOutcome, ExecError> {
        let muted = self.tick_error_off();
        let depth = ctx.depth + cmd.depth;

        let verdict = match self.check_condition(ctx, cmd) {
            Ok(verdict) => verdict,
            Err(e) => {
                self.report(cmd, depth, e, muted)?;
                return Ok(BlockOutcome::CONTINUE);
            }
        };

        if !verdict.matched {
            self.log_cmd(LogState::Ignore, verdict.message, cmd, depth);
            return Ok(BlockOutcome {
                flow: Flow::Continue,
                else_armed: true,
            });
        }

        self.log_cmd(LogState::Success, verdict.message, cmd, depth);
        let inner = self.run_commands(ctx, cmd.body.as_deref().unwrap_or_default())?;
        Ok(BlockOutcome {
            flow: inner.flow,
            else_armed: cmd.chained_if().is_some() && inner.else_armed,
        })
    }

    fn run_else(
        &mut self,
        ctx: &mut ExecutionContext,
        cmd: &Command,
        armed: bool,
    ) -> Result<BlockOutcome, ExecError> {
        let depth = ctx.depth + cmd.depth;
        if !armed {
            self.log_cmd(LogState::Ignore, "Else condition is not met", cmd, depth);
            return Ok(BlockOutcome::CONTINUE);
        }

        self.log_cmd(LogState::Success, "Else condition is met", cmd, depth);
        let inner = self.run_commands(ctx, cmd.body.as_deref().unwrap_or_default())?;
        Ok(BlockOutcome {
            flow: inner.flow,
            else_armed: cmd.is_else_if() && inner.else_armed,
        })
    }

    fn check_condition(&mut self, ctx: &ExecutionContext, cmd: &Command) -> Result<Verdict, ExecError> {
        let condition =
            Condition::from_compact(&cmd.operands).map_err(|e| ExecError::Failed(e.to_string()))?;
        let args = match condition.predicate {
            PredicateKind::ExistVar | PredicateKind::ExistMacro => condition
                .operands
                .iter()
                .map(|op| expand_params(op, &ctx.params, ctx.loop_counter))
                .collect(),
            _ => self.preprocess_all(ctx, cmd, &condition.operands)?,
        };
        let probes = Probes {
            variables: &self.variables,
            macros: &self.macros,
            repo: self.repo,
            registry: self.registry.as_ref(),
        };
        evaluate(&condition, &args, &probes)
    }

    /// Consumes one `ErrorOff` slot. Returns whether this instruction is muted.
    fn tick_error_off(&mut self) -> bool {
        if self.error_off > 0 {
            self.error_off -= 1;
            true
        } else {
            false
        }
    }

    /// Logs a recoverable error, or passes a critical one through.
    fn report(&mut self, cmd: &Command, depth: usize, err: ExecError, muted: bool) -> Result<(), ExecError> {
        if err.is_critical() {
            return Err(err);
        }
        let state = if muted { LogState::Muted } else { LogState::Error };
        self.log_cmd(state, err.to_string(), cmd, depth);
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext, cmd: &Command) -> Result<Flow, ExecError> {
        let muted = self.tick_error_off();
        let depth = ctx.depth + cmd.depth;

        if let Some(op) = cmd.builtin().filter(|op| op.is_deprecated()) {
            self.log_cmd(LogState::Warning, format!("[{op}] is deprecated"), cmd, depth);
        }

        match self.dispatch(ctx, cmd, depth) {
            Ok(flow) => Ok(flow),
            Err(e) => {
                self.report(cmd, depth, e, muted)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn dispatch(&mut self, ctx: &mut ExecutionContext, cmd: &Command, depth: usize) -> Result<Flow, ExecError> {
        let op = match &cmd.opcode {
            OpcodeTag::External(name) => return self.call_macro(ctx, cmd, name, depth),
            OpcodeTag::Builtin(op) => *op,
        };

        match op {
            Opcode::Run => self.call_section(ctx, cmd, false, depth),
            Opcode::Exec => self.call_section(ctx, cmd, true, depth),
            Opcode::Loop => self.run_loop(ctx, cmd, depth),
            Opcode::Set => self.cmd_set(ctx, cmd, depth),
            Opcode::GetParam => self.cmd_get_param(ctx, cmd, depth),
            Opcode::AddVariables => self.cmd_add_variables(ctx, cmd, depth),
            Opcode::Exit => {
                let args = self.preprocess_all(ctx, cmd, &cmd.operands)?;
                let message = args.first().cloned().unwrap_or_default();
                self.log_cmd(LogState::Info, format!("Exit: {message}"), cmd, depth);
                Ok(Flow::Exit)
            }
            Opcode::Halt => {
                let args = self.preprocess_all(ctx, cmd, &cmd.operands)?;
                let message = args.first().cloned().unwrap_or_default();
                let err = ExecError::Halt(message);
                self.log_cmd(LogState::Error, err.to_string(), cmd, depth);
                Err(err)
            }
            Opcode::If
            | Opcode::Else
            | Opcode::Begin
            | Opcode::End
            | Opcode::IfCompact
            | Opcode::ElseCompact
            | Opcode::Link
            | Opcode::None
            | Opcode::Comment => Err(ExecError::Failed(format!("[{op}] cannot be executed directly"))),
            Opcode::System if self.is_engine_system(ctx, cmd)? => self.cmd_system(ctx, cmd, depth),
            _ if self.handlers.contains_key(&op) => self.call_handler(ctx, cmd, op, depth),
            Opcode::Echo => {
                let args = self.preprocess_all(ctx, cmd, &cmd.operands)?;
                let message = args.first().cloned().unwrap_or_default();
                let warn = args.get(1).is_some_and(|a| a.eq_ignore_ascii_case("WARN"));
                let state = if warn { LogState::Warning } else { LogState::Success };
                self.log_cmd(state, message, cmd, depth);
                Ok(Flow::Continue)
            }
            Opcode::Message => {
                let args = self.preprocess_all(ctx, cmd, &cmd.operands)?;
                let message = args.first().cloned().unwrap_or_default();
                self.log_cmd(LogState::Info, message, cmd, depth);
                Ok(Flow::Continue)
            }
            Opcode::Wait => {
                let args = self.preprocess_all(ctx, cmd, &cmd.operands)?;
                let secs: u64 = args
                    .first()
                    .and_then(|a| a.trim().parse().ok())
                    .ok_or_else(|| ExecError::Failed("[Wait] needs a number of seconds".to_string()))?;
                std::thread::sleep(Duration::from_secs(secs));
                self.log_cmd(LogState::Success, format!("Slept {secs} second(s)"), cmd, depth);
                Ok(Flow::Continue)
            }
            Opcode::Beep => {
                self.log_cmd(LogState::Info, "Beep", cmd, depth);
                Ok(Flow::Continue)
            }
            _ => Err(ExecError::NotImplemented(op.name().to_string())),
        }
    }

    /// Expands one operand for dispatch, logging undefined variables.
    fn preprocess(&mut self, ctx: &ExecutionContext, cmd: &Command, text: &str) -> Result<String, ExecError> {
        let expanded = self.expand(ctx, cmd, text)?;
        Ok(unescape(&expanded))
    }

    fn preprocess_all(
        &mut self,
        ctx: &ExecutionContext,
        cmd: &Command,
        operands: &[String],
    ) -> Result<Vec<String>, ExecError> {
        operands.iter().map(|op| self.preprocess(ctx, cmd, op)).collect()
    }

    /// Parameters and variables only; escapes stay in place.
    fn expand(&mut self, ctx: &ExecutionContext, cmd: &Command, text: &str) -> Result<String, ExecError> {
        let with_params = expand_params(text, &ctx.params, ctx.loop_counter);
        let expansion = self.variables.expand(&with_params)?;
        let depth = ctx.depth + cmd.depth;
        for name in &expansion.undefined {
            self.log_cmd(LogState::Warning, format!("Variable [%{name}%] is not defined"), cmd, depth);
        }
        Ok(expansion.text)
    }

    fn call_handler(
        &mut self,
        ctx: &ExecutionContext,
        cmd: &Command,
        op: Opcode,
        depth: usize,
    ) -> Result<Flow, ExecError> {
        let args = self.preprocess_all(ctx, cmd, &cmd.operands)?;
        let Self {
            handlers, variables, ..
        } = self;
        let handler = handlers
            .get_mut(&op)
            .ok_or_else(|| ExecError::NotImplemented(op.name().to_string()))?;
        let message = handler.execute(HandlerCall {
            cmd,
            args: &args,
            variables,
        })?;
        self.log_cmd(LogState::Success, message, cmd, depth);
        Ok(Flow::Continue)
    }

    /// Resolves the script operand of `Run`/`Exec`/`Loop`/`AddVariables`.
    fn resolve_script_ref(
        &mut self,
        ctx: &ExecutionContext,
        cmd: &Command,
        raw: &str,
        section: &str,
    ) -> Result<String, ExecError> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("%ScriptFile%") || trimmed.eq_ignore_ascii_case("%PluginFile%") {
            return Ok(ctx.script.clone());
        }
        let reference = self.preprocess(ctx, cmd, raw)?;
        self.repo
            .resolve_script(&reference)
            .map(String::from)
            .ok_or_else(|| ExecError::SectionNotFound {
                script: reference,
                section: section.to_string(),
            })
    }

    fn call_section(
        &mut self,
        ctx: &ExecutionContext,
        cmd: &Command,
        exec: bool,
        depth: usize,
    ) -> Result<Flow, ExecError> {
        let name = if exec { "Exec" } else { "Run" };
        if cmd.operands.len() < 2 {
            return Err(ExecError::Failed(format!("[{name}] needs a script and a section")));
        }
        let section = self.preprocess(ctx, cmd, &cmd.operands[1])?;
        let script = self.resolve_script_ref(ctx, cmd, &cmd.operands[0], &section)?;
        let params = self.preprocess_all(ctx, cmd, &cmd.operands[2..])?;

        if self.repo.get_section(&script, &section).is_none() {
            return Err(ExecError::SectionNotFound { script, section });
        }
        if exec {
            if let Some(lines) = self.repo.get_section(&script, VARIABLES_SECTION) {
                let lines = lines.to_vec();
                self.import_variables(Scope::Local, &lines, depth);
            }
        }

        let message = if script == ctx.script {
            format!("Processing section [{section}]")
        } else {
            format!("Processing [{script}]'s section [{section}]")
        };
        self.log_cmd(LogState::Success, message, cmd, depth);

        let child = ctx.child(script, section, params, depth + 1);
        self.enter_section(child)
    }

    fn run_loop(&mut self, ctx: &ExecutionContext, cmd: &Command, depth: usize) -> Result<Flow, ExecError> {
        if cmd.operands.len() == 1 && cmd.operands[0].trim().eq_ignore_ascii_case("BREAK") {
            self.log_cmd(LogState::Success, "Breaking loop", cmd, depth);
            return Ok(Flow::Break);
        }
        if cmd.operands.len() < 4 {
            return Err(ExecError::Failed(
                "[Loop] needs a script, a section, a start and an end".to_string(),
            ));
        }

        let section = self.preprocess(ctx, cmd, &cmd.operands[1])?;
        let script = self.resolve_script_ref(ctx, cmd, &cmd.operands[0], &section)?;
        let bound = |text: String| {
            text.trim()
                .parse::<i64>()
                .map_err(|_| ExecError::Failed(format!("[{text}] is not a valid loop bound")))
        };
        let start = bound(self.preprocess(ctx, cmd, &cmd.operands[2])?)?;
        let end = bound(self.preprocess(ctx, cmd, &cmd.operands[3])?)?;
        let params = self.preprocess_all(ctx, cmd, &cmd.operands[4..])?;

        if self.repo.get_section(&script, &section).is_none() {
            return Err(ExecError::SectionNotFound { script, section });
        }
        self.log_cmd(
            LogState::Success,
            format!("Loop section [{section}] from [{start}] to [{end}]"),
            cmd,
            depth,
        );

        for counter in start..=end {
            let mut child = ctx.child(script.clone(), section.clone(), params.clone(), depth + 1);
            child.loop_counter = Some(counter);
            match self.enter_section(child)? {
                Flow::Continue => {}
                Flow::Break => break,
                Flow::Exit => return Ok(Flow::Exit),
            }
        }
        Ok(Flow::Continue)
    }

    fn call_macro(
        &mut self,
        ctx: &ExecutionContext,
        cmd: &Command,
        name: &str,
        depth: usize,
    ) -> Result<Flow, ExecError> {
        let commands = match self.macros.get(name) {
            Some(m) => Arc::clone(&m.commands),
            None => return Err(ExecError::UnknownMacro(name.to_string())),
        };
        if self.call_depth >= self.config.max_call_depth {
            let err = ExecError::CallDepth(self.config.max_call_depth);
            self.log_cmd(LogState::Error, err.to_string(), cmd, depth);
            return Err(err);
        }
        let params = self.preprocess_all(ctx, cmd, &cmd.operands)?;
        debug!(name, ?params, "macro call");

        let mut child = ctx.child(ctx.script.clone(), ctx.section.clone(), params, depth);
        self.call_depth += 1;
        let result = self.run_commands(&mut child, &commands);
        self.call_depth -= 1;
        result.map(|outcome| outcome.flow)
    }

    fn cmd_set(&mut self, ctx: &mut ExecutionContext, cmd: &Command, depth: usize) -> Result<Flow, ExecError> {
        if !(2..=3).contains(&cmd.operands.len()) {
            return Err(ExecError::Failed("[Set] takes 2 or 3 operands".to_string()));
        }
        let key = cmd.operands[0].trim();
        let value = self.expand(ctx, cmd, &cmd.operands[1])?;
        let mode = match cmd.operands.get(2) {
            Some(raw) => self.preprocess(ctx, cmd, raw)?.to_ascii_uppercase(),
            None => String::new(),
        };
        let scope = match mode.as_str() {
            "" => Scope::Local,
            "GLOBAL" | "PERMANENT" => Scope::Global,
            other => return Err(ExecError::Failed(format!("Invalid [Set] mode [{other}]"))),
        };

        if let Some(index) = key.strip_prefix('#').and_then(|n| n.parse::<usize>().ok()) {
            if index == 0 {
                return Err(ExecError::Failed("Section parameters start at #1".to_string()));
            }
            let value = unescape(&value);
            ctx.set_param(index, value.clone());
            self.log_cmd(LogState::Success, format!("Section parameter [#{index}] set to [{value}]"), cmd, depth);
            return Ok(Flow::Continue);
        }

        let name = strip_percent(key)
            .ok_or_else(|| ExecError::Failed(format!("Invalid variable name [{key}]")))?;

        if value.eq_ignore_ascii_case("NIL") {
            let global = self.variables.remove(Scope::Global, name);
            let local = self.variables.remove(Scope::Local, name);
            let (state, message) = match (global, local) {
                (true, true) => (LogState::Success, format!("Global and local variable [%{name}%] removed")),
                (true, false) => (LogState::Success, format!("Global variable [%{name}%] removed")),
                (false, true) => (LogState::Success, format!("Local variable [%{name}%] removed")),
                (false, false) => (LogState::Ignore, format!("Variable [%{name}%] does not exist")),
            };
            self.log_cmd(state, message, cmd, depth);
            return Ok(Flow::Continue);
        }

        self.variables.set(scope, name, &value)?;
        if scope == Scope::Global {
            self.variables.remove(Scope::Local, name);
        }
        let tier = match scope {
            Scope::Global => "Global variable",
            _ => "Local variable",
        };
        self.log_cmd(LogState::Success, format!("{tier} [%{name}%] set to [{value}]"), cmd, depth);
        if mode == "PERMANENT" {
            self.log_cmd(
                LogState::Info,
                format!("Variable [%{name}%] is kept for this build only"),
                cmd,
                depth,
            );
        }
        Ok(Flow::Continue)
    }

    fn cmd_get_param(&mut self, ctx: &ExecutionContext, cmd: &Command, depth: usize) -> Result<Flow, ExecError> {
        if cmd.operands.len() != 2 {
            return Err(ExecError::Failed("[GetParam] takes an index and a variable".to_string()));
        }
        let index_text = self.preprocess(ctx, cmd, &cmd.operands[0])?;
        let index: usize = index_text
            .trim()
            .parse()
            .map_err(|_| ExecError::Failed(format!("[{index_text}] is not a parameter index")))?;
        let key = cmd.operands[1].trim();
        let name = strip_percent(key)
            .ok_or_else(|| ExecError::Failed(format!("Invalid variable name [{key}]")))?;
        let value = ctx.param(index).unwrap_or_default().to_string();
        self.variables.set(Scope::Local, name, &value)?;
        self.log_cmd(
            LogState::Success,
            format!("Local variable [%{name}%] set to section parameter [#{index}]"),
            cmd,
            depth,
        );
        Ok(Flow::Continue)
    }

    fn cmd_add_variables(&mut self, ctx: &ExecutionContext, cmd: &Command, depth: usize) -> Result<Flow, ExecError> {
        if !(2..=3).contains(&cmd.operands.len()) {
            return Err(ExecError::Failed("[AddVariables] takes 2 or 3 operands".to_string()));
        }
        let section = self.preprocess(ctx, cmd, &cmd.operands[1])?;
        let script = self.resolve_script_ref(ctx, cmd, &cmd.operands[0], &section)?;
        let scope = match cmd.operands.get(2) {
            Some(raw) if self.preprocess(ctx, cmd, raw)?.eq_ignore_ascii_case("GLOBAL") => Scope::Global,
            Some(raw) => return Err(ExecError::Failed(format!("Invalid [AddVariables] mode [{raw}]"))),
            None => Scope::Local,
        };
        let lines = self
            .repo
            .get_section(&script, &section)
            .ok_or_else(|| ExecError::SectionNotFound {
                script: script.clone(),
                section: section.clone(),
            })?
            .to_vec();
        self.import_variables(scope, &lines, depth);
        self.log_cmd(
            LogState::Success,
            format!("Variables imported from [{script}]'s section [{section}]"),
            cmd,
            depth,
        );
        Ok(Flow::Continue)
    }

    /// `System,ErrorOff` and `System,Log` are handled by the engine itself.
    fn is_engine_system(&mut self, ctx: &ExecutionContext, cmd: &Command) -> Result<bool, ExecError> {
        let Some(raw) = cmd.operands.first() else {
            return Err(ExecError::Failed("[System] needs a sub-command".to_string()));
        };
        let sub = self.preprocess(ctx, cmd, raw)?;
        Ok(sub.eq_ignore_ascii_case("ErrorOff") || sub.eq_ignore_ascii_case("Log"))
    }

    fn cmd_system(&mut self, ctx: &ExecutionContext, cmd: &Command, depth: usize) -> Result<Flow, ExecError> {
        let args = self.preprocess_all(ctx, cmd, &cmd.operands)?;
        let sub = args[0].to_ascii_lowercase();

        if sub == "erroroff" {
            let lines = match args.get(1) {
                Some(n) => n
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ExecError::Failed(format!("[{n}] is not a line count")))?,
                None => 1,
            };
            self.error_off = lines;
            self.log_cmd(
                LogState::Success,
                format!("Errors of the next {lines} command(s) are muted"),
                cmd,
                depth,
            );
            return Ok(Flow::Continue);
        }

        match args.get(1).map(|a| a.to_ascii_lowercase()).as_deref() {
            Some("off") => {
                self.log_cmd(LogState::Success, "Logging suspended", cmd, depth);
                self.log_suspended = true;
            }
            Some("on") => {
                self.log_suspended = false;
                self.log_cmd(LogState::Success, "Logging resumed", cmd, depth);
            }
            _ => return Err(ExecError::Failed("[System,Log] takes On or Off".to_string())),
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Project, Script};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn project(process: &str) -> Project {
        Project::from_scripts(vec![Script::parse("main.script", process)])
    }

    fn run(src: &str) -> MemoryLogger {
        let project = project(src);
        let mut engine = Engine::new(&project, EngineConfig::default());
        engine.build().unwrap();
        engine.into_logger()
    }

    #[test]
    fn test_context_params() {
        let mut ctx = ExecutionContext::new("s", "Process", vec!["a".into()]);
        assert_eq!(ctx.param(1), Some("a"));
        assert_eq!(ctx.param(0), None);
        ctx.set_param(3, "c".into());
        assert_eq!(ctx.params, vec!["a", "", "c"]);
    }

    #[test]
    fn test_if_true_runs_body() {
        let log = run("[Process]\nSet,%A%,B\nIf,%A%,Equal,B,Echo,Success");
        assert!(log.messages(LogState::Success).contains(&"Success"));
    }

    #[test]
    fn test_if_false_skips_body_and_runs_else() {
        let log = run("[Process]\nIf,%A%,Equal,B,Echo,yes\nElse,Echo,no");
        let success = log.messages(LogState::Success);
        assert!(!success.contains(&"yes"));
        assert!(success.contains(&"no"));
    }

    #[test]
    fn test_set_keeps_escapes_until_use() {
        let log = run("[Process]\nSet,%A%,x#$cy\nEcho,%A%");
        assert!(log.messages(LogState::Success).contains(&"x,y"));
    }

    #[test]
    fn test_handler_receives_expanded_args() {
        let project = project("[Process]\nSet,%Src%,a.txt\nFileCopy,%Src%,b#$s.txt");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut engine = Engine::new(&project, EngineConfig::default());
        engine.register(Opcode::FileCopy, move |call: HandlerCall<'_>| -> Result<String, ExecError> {
            sink.borrow_mut().push(call.args.to_vec());
            Ok(format!("Copied [{}]", call.args[0]))
        });
        engine.build().unwrap();
        assert_eq!(*seen.borrow(), vec![vec!["a.txt".to_string(), "b .txt".to_string()]]);
    }

    #[test]
    fn test_unhandled_opcode_is_recoverable() {
        let log = run("[Process]\nFileCopy,a,b\nEcho,after");
        assert_eq!(log.count(LogState::Error), 1);
        assert!(log.messages(LogState::Success).contains(&"after"));
    }

    #[test]
    fn test_compile_cache_keeps_failures() {
        let project = project("[Process]\nEcho,x\n[Bad]\nEnd");
        let mut engine = Engine::new(&project, EngineConfig::default());
        assert!(matches!(engine.compiled_section("main.script", "Bad"), Err(ExecError::Compile(_))));
        assert!(matches!(engine.compiled_section("main.script", "bad"), Err(ExecError::Compile(_))));
        let first = engine.compiled_section("main.script", "Process").unwrap();
        let second = engine.compiled_section("main.script", "Process").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}

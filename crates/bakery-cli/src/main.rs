//! Command-line checker and runner for bakery build scripts.
//!
//! # Usage
//!
//! ```bash
//! # Compile every section of every script and report errors
//! bakery check project/
//!
//! # Check one section only
//! bakery check setup.script --section Process
//!
//! # Print the compiled tree of a section
//! bakery compile setup.script --section Process
//! bakery -f json compile setup.script --section Process
//!
//! # Tokenize a single line
//! bakery tokenize 'If,%A%,Equal,B,Echo,"a,b"'
//!
//! # Run a whole project, writing the build log as JSON Lines
//! bakery run project/ --log-file build.jsonl
//!
//! # Run one section with parameters
//! bakery run setup.script --section Greet --param Alice
//! ```

mod render;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bakery_core::command::SectionAddress;
use bakery_core::compiler::compile_section;
use bakery_core::config::EngineConfig;
use bakery_core::engine::Engine;
use bakery_core::logger::MemoryLogger;
use bakery_core::script::{Project, Script, SectionRepository, VARIABLES_SECTION};
use bakery_core::tokenizer::tokenize_line;
use bakery_core::variables::{Scope, UndefinedPolicy, VariableStore};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Check, inspect and run bakery build scripts.
#[derive(Parser)]
#[command(name = "bakery")]
#[command(about = "Check, inspect and run bakery build scripts")]
#[command(version)]
struct Cli {
    /// Engine config file (defaults to ~/.bakery/config.json)
    #[arg(short, long, env = "BAKERY_CONFIG")]
    config: Option<PathBuf>,

    /// Also write diagnostics to bakery.log in this directory
    #[arg(long, env = "BAKERY_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum UndefinedArg {
    Empty,
    Literal,
}

#[derive(Subcommand)]
enum Command {
    /// Compile scripts and report syntax errors
    Check {
        /// Script files or project directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Only check this section
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Print the compiled command tree of a section
    Compile {
        /// Script file
        script: PathBuf,
        /// Section to compile
        #[arg(short, long, default_value = "Process")]
        section: String,
    },

    /// Tokenize a single script line
    Tokenize {
        /// The raw line
        line: String,
    },

    /// Run a build, or a single section
    Run {
        /// Project directory or script file
        path: PathBuf,
        /// Run only this section of the main script
        #[arg(short, long)]
        section: Option<String>,
        /// Positional parameter for --section (repeatable)
        #[arg(short, long = "param")]
        params: Vec<String>,
        /// Write the build log to this file as JSON Lines
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Maximum nesting of section calls
        #[arg(long, env = "BAKERY_MAX_CALL_DEPTH")]
        max_call_depth: Option<usize>,
        /// What an undefined %Name% expands to
        #[arg(long, env = "BAKERY_UNDEFINED")]
        undefined: Option<UndefinedArg>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_dir.as_deref());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn init_tracing(log_dir: Option<&Path>) {
    let file_layer = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        let appender = tracing_appender::rolling::never(dir, "bakery.log");
        Some(tracing_subscriber::fmt::layer().with_writer(appender).with_ansi(false))
    });

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
}

#[derive(Debug)]
enum CliError {
    Parse(String),
    Runtime(String),
    Io(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Parse(_) => ExitCode::from(2),
            CliError::Runtime(_) => ExitCode::from(3),
            CliError::Io(_) => ExitCode::from(4),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Parse(msg) => write!(f, "Parse error: {}", msg),
            CliError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
            CliError::Io(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)
            .map_err(|e| CliError::Io(format!("{}: {}", path.display(), e)))?,
        None => EngineConfig::load(),
    };
    debug!(?config, "engine config loaded");

    match cli.command {
        Command::Check { ref paths, ref section } => check(paths, section.as_deref(), &config, cli.format),
        Command::Compile { ref script, ref section } => compile(script, section, cli.format),
        Command::Tokenize { ref line } => {
            let cmd = tokenize_line(line).map_err(|e| CliError::Parse(e.to_string()))?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&cmd).map_err(json_error)?),
                OutputFormat::Text => print!("{}", render::command_fields(&cmd)),
            }
            Ok(())
        }
        Command::Run {
            ref path,
            ref section,
            ref params,
            ref log_file,
            max_call_depth,
            undefined,
        } => {
            let mut config = config;
            if let Some(depth) = max_call_depth {
                config.max_call_depth = depth;
            }
            if let Some(undefined) = undefined {
                config.undefined_variables = match undefined {
                    UndefinedArg::Empty => UndefinedPolicy::Empty,
                    UndefinedArg::Literal => UndefinedPolicy::Literal,
                };
            }
            run_build(path, section.as_deref(), params, log_file.as_deref(), config, cli.format)
        }
    }
}

fn json_error(e: serde_json::Error) -> CliError {
    CliError::Runtime(e.to_string())
}

fn load_project(path: &Path, extension: &str) -> Result<Project, CliError> {
    let project = if path.is_dir() {
        Project::load_dir(path, extension)
    } else {
        Project::load_files(&[path.to_path_buf()])
    };
    project.map_err(|e| CliError::Io(e.to_string()))
}

/// Sections holding key-value data rather than code.
fn is_data_section(name: &str) -> bool {
    name.eq_ignore_ascii_case("Main") || name.eq_ignore_ascii_case(VARIABLES_SECTION)
}

fn check(paths: &[PathBuf], only: Option<&str>, config: &EngineConfig, format: OutputFormat) -> Result<(), CliError> {
    let mut checked = 0usize;
    let mut errors = Vec::new();

    for path in paths {
        let project = load_project(path, &config.script_extension)?;
        for script in project.all_scripts() {
            for section in script.sections() {
                let selected = match only {
                    Some(name) => section.name.eq_ignore_ascii_case(name),
                    None => !is_data_section(&section.name),
                };
                if !selected {
                    continue;
                }
                let address = SectionAddress::new(script.id(), section.name.as_str(), section.lines.len());
                checked += 1;
                if let Err(e) = compile_section(&section.lines, &address) {
                    errors.push(e);
                }
            }
        }
    }
    info!(checked, errors = errors.len(), "check finished");

    match format {
        OutputFormat::Json => {
            let report: Vec<_> = errors
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "script": &*e.address.script,
                        "section": &*e.address.section,
                        "line": e.address.line,
                        "text": e.line,
                        "error": e.source.to_string(),
                    })
                })
                .collect();
            println!("{}", serde_json::json!({ "checked": checked, "errors": report }));
        }
        OutputFormat::Text => {
            for e in &errors {
                println!("error: {}", e);
            }
            println!("{} section(s) checked, {} error(s)", checked, errors.len());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(CliError::Parse(format!("{} section(s) failed to compile", errors.len())))
    }
}

fn compile(path: &Path, section: &str, format: OutputFormat) -> Result<(), CliError> {
    let script = Script::load(path, path.display().to_string()).map_err(|e| CliError::Io(e.to_string()))?;
    let found = script
        .section(section)
        .ok_or_else(|| CliError::Runtime(format!("Section [{}] not found in [{}]", section, script.id())))?;
    let address = SectionAddress::new(script.id(), found.name.as_str(), found.lines.len());
    let tree = compile_section(&found.lines, &address).map_err(|e| CliError::Parse(e.to_string()))?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tree).map_err(json_error)?),
        OutputFormat::Text => print!("{}", render::tree(&tree)),
    }
    Ok(())
}

fn run_build(
    path: &Path,
    section: Option<&str>,
    params: &[String],
    log_file: Option<&Path>,
    config: EngineConfig,
    format: OutputFormat,
) -> Result<(), CliError> {
    let project = load_project(path, &config.script_extension)?;

    let mut logger = MemoryLogger::new(config.log_capacity);
    if let Some(file) = log_file {
        logger = logger
            .with_file(file)
            .map_err(|e| CliError::Io(format!("{}: {}", file.display(), e)))?;
    }

    let mut engine = Engine::with_logger(&project, config, logger);
    if let Some(root) = project.root() {
        engine
            .variables_mut()
            .set(Scope::Fixed, "ProjectDir", &root.display().to_string())
            .map_err(|e| CliError::Runtime(e.to_string()))?;
    }

    let outcome = match section {
        Some(section) => {
            let main = project
                .main_script()
                .ok_or_else(|| CliError::Io(format!("No script found in [{}]", path.display())))?
                .to_string();
            engine.run_section(&main, section, params.to_vec()).map(|_| None)
        }
        None => engine.build().map(Some),
    };

    match format {
        OutputFormat::Json => {
            for entry in engine.logger().entries() {
                println!("{}", serde_json::to_string(entry).map_err(json_error)?);
            }
        }
        OutputFormat::Text => {
            print!("{}", engine.logger().render());
            if let Ok(Some(summary)) = &outcome {
                println!("{}", render::summary(summary));
            }
        }
    }

    outcome.map(|_| ()).map_err(|e| CliError::Runtime(e.to_string()))
}

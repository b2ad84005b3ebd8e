pub mod config;
pub mod dispatcher;
pub mod host;
pub mod logging;
pub mod model;
pub mod output;
pub mod panel;
pub mod registry;
pub mod runner;
pub mod supervisor;
pub mod testing;
pub mod ui;

use std::path::PathBuf;

use thiserror::Error;

pub use config::{PanelConfig, ProcvisorConfig, SupervisorConfig};
pub use host::{HostError, HostEvent, HostHandle, HostSpawnSpec, ProcessHost, SystemProcessHost};
pub use model::{
    BackgroundProcess, OutputLine, OutputStream, ProcessId, ProcessStatus, ProcessSummary,
    SpawnRequest,
};
pub use output::OutputBuffer;
pub use panel::{PanelState, PanelViewModel};
pub use registry::{NoticeReceiver, ProcessRegistry, RegistryError, RegistryNotice};
pub use supervisor::{ProcessSupervisor, SpawnError, StopAllReport, StopError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run(RunArgs),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunArgs {
    pub config: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub processes: Vec<ProcessArg>,
}

/// One `NAME=COMMAND` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessArg {
    pub name: String,
    pub command: String,
}

impl ProcessArg {
    pub fn parse(raw: &str) -> Result<Self, CliParseError> {
        let Some((name, command)) = raw.split_once('=') else {
            return Err(CliParseError::InvalidProcess(raw.to_owned()));
        };
        let name = name.trim();
        let command = command.trim();
        if name.is_empty() || command.is_empty() {
            return Err(CliParseError::InvalidProcess(raw.to_owned()));
        }
        Ok(Self {
            name: name.to_owned(),
            command: command.to_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CliParseError {
    #[error("--config requires a value")]
    MissingConfigValue,
    #[error("--cwd requires a value")]
    MissingCwdValue,
    #[error("expected NAME=COMMAND, got `{0}`")]
    InvalidProcess(String),
    #[error("duplicate process name `{0}`")]
    DuplicateName(String),
    #[error("run requires at least one NAME=COMMAND")]
    NoProcesses,
    #[error("unknown argument: {0}")]
    UnknownArgument(String),
}

pub fn parse_command<I>(args: I) -> Result<Command, CliParseError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let Some(cmd) = args.next() else {
        return Ok(Command::Help);
    };

    match cmd.as_str() {
        "--help" | "-h" | "help" => Ok(Command::Help),
        "run" => parse_run(args),
        other => Err(CliParseError::UnknownArgument(other.to_owned())),
    }
}

fn parse_run<I>(args: I) -> Result<Command, CliParseError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut run = RunArgs::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let Some(path) = args.next() else {
                    return Err(CliParseError::MissingConfigValue);
                };
                run.config = Some(PathBuf::from(path));
            }
            "--cwd" => {
                let Some(path) = args.next() else {
                    return Err(CliParseError::MissingCwdValue);
                };
                run.cwd = Some(PathBuf::from(path));
            }
            "--help" | "-h" => return Ok(Command::Help),
            other if other.starts_with("--") => {
                return Err(CliParseError::UnknownArgument(other.to_owned()))
            }
            other => {
                let process = ProcessArg::parse(other)?;
                if run.processes.iter().any(|known| known.name == process.name) {
                    return Err(CliParseError::DuplicateName(process.name));
                }
                run.processes.push(process);
            }
        }
    }

    if run.processes.is_empty() {
        return Err(CliParseError::NoProcesses);
    }
    Ok(Command::Run(run))
}

pub fn print_usage() {
    eprintln!(
        "procvisor\n\nUSAGE:\n  procvisor run [--config <PATH>] [--cwd <PATH>] NAME=COMMAND...\n\nCOMMANDS:\n  run               Supervise each COMMAND (run through `sh -lc`) until all exit\n\nOPTIONS (run):\n  --config <PATH>   Read settings from PATH instead of <cwd>/procvisor.toml\n  --cwd <PATH>      Working directory for every process\n\nENVIRONMENT:\n  PROCVISOR_COLOR   always | never | auto\n  PROCVISOR_LOG     tracing filter directives (default: warn)\n\nGENERAL:\n  -h, --help        Print help\n"
    );
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, ProcvisorConfig};
use crate::host::SystemProcessHost;
use crate::model::{OutputLine, ProcessId, ProcessStatus, ProcessSummary, SpawnRequest};
use crate::output::strip_control_sequences;
use crate::registry::RegistryNotice;
use crate::supervisor::{ProcessSupervisor, SpawnError, SupervisorError};
use crate::ui::table::process_table;
use crate::ui::{NoticeLevel, OutputMode, PlainRenderer, StatusTally, UiError};
use crate::{ProcessArg, RunArgs};

const SHELL: &str = "sh";
const SHELL_FLAGS: &str = "-lc";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to resolve current directory: {0}")]
    Cwd(#[source] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("ui render failed: {0}")]
    Ui(#[from] UiError),
    #[error("host event feed closed before every process finished")]
    FeedClosed,
}

/// Final state of every process started by one `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub processes: Vec<ProcessSummary>,
}

impl RunReport {
    pub fn tally(&self) -> StatusTally {
        let mut tally = StatusTally::default();
        for process in &self.processes {
            match process.status {
                ProcessStatus::Completed => tally.completed += 1,
                ProcessStatus::Stopped => tally.stopped += 1,
                ProcessStatus::Failed => tally.failed += 1,
                ProcessStatus::Starting | ProcessStatus::Running => {}
            }
        }
        tally
    }

    pub fn succeeded(&self) -> bool {
        self.tally().failed == 0
    }
}

pub fn run_command(args: RunArgs, mode: OutputMode) -> Result<RunReport, RunnerError> {
    let mut renderer = PlainRenderer::stdout(mode);
    run_with_renderer(args, &mut renderer)
}

pub fn run_with_renderer<W: Write>(
    args: RunArgs,
    renderer: &mut PlainRenderer<W>,
) -> Result<RunReport, RunnerError> {
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().map_err(RunnerError::Cwd)?,
    };
    let config = match &args.config {
        Some(path) => ProcvisorConfig::load(path)?,
        None => ProcvisorConfig::discover(&cwd)?,
    };
    debug!(cwd = %cwd.display(), ?config, "starting run");
    let supervisor =
        ProcessSupervisor::start(Arc::new(SystemProcessHost::new()), config.supervisor)?;
    run_processes(&supervisor, &args.processes, &cwd, renderer)
}

/// Spawns every process, streams its output until all of them finished and
/// renders a summary table.
pub fn run_processes<W: Write>(
    supervisor: &ProcessSupervisor,
    processes: &[ProcessArg],
    cwd: &Path,
    renderer: &mut PlainRenderer<W>,
) -> Result<RunReport, RunnerError> {
    let notices = supervisor
        .registry()
        .subscribe_with_capacity(supervisor.config().notice_capacity);
    let mut stream = StreamState::default();

    for process in processes {
        let request = SpawnRequest::new(&process.name, SHELL)
            .with_args([SHELL_FLAGS, process.command.as_str()])
            .with_cwd(cwd);
        let id = match supervisor.spawn_process(request) {
            Ok(id) => id,
            Err(SpawnError::Host {
                process_id,
                message,
            }) => {
                renderer.notice(NoticeLevel::Error, &format!("{}: {message}", process.name))?;
                process_id
            }
            Err(error) => return Err(error.into()),
        };
        // Spawn failures still report a terminal status through the feed.
        stream.track(id, &process.name);
    }

    while !stream.pending.is_empty() {
        // Drops only happen while the queue is full, so they are always
        // noticed before the next blocking receive.
        let dropped = notices.take_dropped();
        if dropped > 0 {
            debug!(dropped, "notice queue overflowed; re-reading registry");
            stream.resync(supervisor, renderer)?;
            continue;
        }
        let Ok(notice) = notices.recv() else {
            return Err(RunnerError::FeedClosed);
        };
        stream.render(supervisor, &notice, renderer)?;
    }
    while let Ok(notice) = notices.try_recv() {
        stream.render(supervisor, &notice, renderer)?;
    }
    if notices.take_dropped() > 0 {
        stream.resync(supervisor, renderer)?;
    }

    let report = RunReport {
        processes: stream
            .order
            .iter()
            .filter_map(|id| supervisor.registry().summary(id))
            .collect(),
    };
    renderer.table(&process_table(&report.processes))?;
    renderer.summary(report.tally())?;
    Ok(report)
}

/// What has been printed so far for the processes of one run.
#[derive(Default)]
struct StreamState {
    names: HashMap<ProcessId, String>,
    order: Vec<ProcessId>,
    pending: HashSet<ProcessId>,
    last_line: HashMap<ProcessId, u64>,
}

impl StreamState {
    fn track(&mut self, id: ProcessId, name: &str) {
        self.pending.insert(id.clone());
        self.names.insert(id.clone(), name.to_owned());
        self.order.push(id);
    }

    fn render<W: Write>(
        &mut self,
        supervisor: &ProcessSupervisor,
        notice: &RegistryNotice,
        renderer: &mut PlainRenderer<W>,
    ) -> Result<(), RunnerError> {
        match notice {
            RegistryNotice::Output { process_id, line } => {
                self.print_line(process_id, line, renderer)
            }
            RegistryNotice::Created { process_id, status }
            | RegistryNotice::StatusChanged { process_id, status }
                if status.is_terminal() =>
            {
                let exit_code = supervisor
                    .registry()
                    .summary(process_id)
                    .and_then(|summary| summary.exit_code);
                self.finish(process_id, *status, exit_code, renderer)
            }
            _ => Ok(()),
        }
    }

    /// Catches up from the registry after notices were lost: prints buffered
    /// lines newer than the last one shown, then any terminal status.
    fn resync<W: Write>(
        &mut self,
        supervisor: &ProcessSupervisor,
        renderer: &mut PlainRenderer<W>,
    ) -> Result<(), RunnerError> {
        for id in self.order.clone() {
            let Some(summary) = supervisor.registry().summary(&id) else {
                continue;
            };
            for line in supervisor.registry().output_lines(&id).unwrap_or_default() {
                self.print_line(&id, &line, renderer)?;
            }
            if summary.status.is_terminal() {
                self.finish(&id, summary.status, summary.exit_code, renderer)?;
            }
        }
        Ok(())
    }

    fn print_line<W: Write>(
        &mut self,
        id: &ProcessId,
        line: &OutputLine,
        renderer: &mut PlainRenderer<W>,
    ) -> Result<(), RunnerError> {
        let Some(name) = self.names.get(id) else {
            return Ok(());
        };
        let last = self.last_line.entry(id.clone()).or_default();
        if line.id <= *last {
            return Ok(());
        }
        *last = line.id;
        let content = strip_control_sequences(&line.content);
        renderer.output_line(name, line.stream, &content)?;
        Ok(())
    }

    fn finish<W: Write>(
        &mut self,
        id: &ProcessId,
        status: ProcessStatus,
        exit_code: Option<i32>,
        renderer: &mut PlainRenderer<W>,
    ) -> Result<(), RunnerError> {
        if !self.pending.remove(id) {
            return Ok(());
        }
        if let Some(name) = self.names.get(id) {
            renderer.status_line(name, status, exit_code)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessDescriptor;

    fn summary(status: ProcessStatus) -> ProcessSummary {
        let mut process = crate::model::BackgroundProcess::new(
            ProcessId::generate(),
            ProcessDescriptor::from(&SpawnRequest::new("x", "sh")),
            1,
            4,
        );
        process.status = status;
        process.summary()
    }

    #[test]
    fn report_fails_when_any_process_failed() {
        let report = RunReport {
            processes: vec![
                summary(ProcessStatus::Completed),
                summary(ProcessStatus::Stopped),
            ],
        };
        assert!(report.succeeded());
        assert_eq!(
            report.tally(),
            StatusTally {
                completed: 1,
                stopped: 1,
                failed: 0,
            }
        );

        let report = RunReport {
            processes: vec![summary(ProcessStatus::Failed)],
        };
        assert!(!report.succeeded());
    }
}

use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::host::HostHandle;
use crate::output::OutputBuffer;

/// Milliseconds since the unix epoch.
pub type EpochMillis = u64;

pub fn now_epoch_ms() -> EpochMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as EpochMillis)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    #[default]
    Starting,
    Running,
    Stopped,
    Failed,
    Completed,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Completed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Legal forward edges. Terminal states have none.
    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        match (self, next) {
            (Self::Starting, Self::Running) | (Self::Starting, Self::Failed) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLine {
    pub id: u64,
    pub content: String,
    pub stream: OutputStream,
    pub timestamp: EpochMillis,
}

/// Caller-facing spawn request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpawnRequest {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub project_path: PathBuf,
    pub project_name: Option<String>,
    pub env: Vec<(String, String)>,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
}

impl SpawnRequest {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        let cwd = cwd.into();
        if self.project_path.as_os_str().is_empty() {
            self.project_path = cwd.clone();
        }
        self.cwd = cwd;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_conversation(
        mut self,
        conversation_id: impl Into<String>,
        message_id: Option<String>,
    ) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self.message_id = message_id;
        self
    }
}

/// Descriptive fields fixed at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDescriptor {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub project_path: PathBuf,
    pub project_name: Option<String>,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
}

impl From<&SpawnRequest> for ProcessDescriptor {
    fn from(request: &SpawnRequest) -> Self {
        Self {
            name: request.name.clone(),
            command: request.command.clone(),
            args: request.args.clone(),
            cwd: request.cwd.clone(),
            project_path: request.project_path.clone(),
            project_name: request.project_name.clone(),
            conversation_id: request.conversation_id.clone(),
            message_id: request.message_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundProcess {
    pub id: ProcessId,
    #[serde(flatten)]
    pub descriptor: ProcessDescriptor,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub started_at: EpochMillis,
    pub ended_at: Option<EpochMillis>,
    pub port: Option<u16>,
    #[serde(flatten)]
    pub output: OutputBuffer,
    pub auto_scroll: bool,
    pub stopping: bool,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub(crate) handle: Option<HostHandle>,
}

impl BackgroundProcess {
    pub fn new(
        id: ProcessId,
        descriptor: ProcessDescriptor,
        started_at: EpochMillis,
        output_capacity: usize,
    ) -> Self {
        Self {
            id,
            descriptor,
            status: ProcessStatus::Starting,
            pid: None,
            exit_code: None,
            started_at,
            ended_at: None,
            port: None,
            output: OutputBuffer::new(output_capacity),
            auto_scroll: true,
            stopping: false,
            last_error: None,
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn summary(&self) -> ProcessSummary {
        ProcessSummary {
            id: self.id.clone(),
            descriptor: self.descriptor.clone(),
            status: self.status,
            pid: self.pid,
            exit_code: self.exit_code,
            started_at: self.started_at,
            ended_at: self.ended_at,
            port: self.port,
            total_line_count: self.output.total_line_count(),
            buffered_line_count: self.output.len(),
            auto_scroll: self.auto_scroll,
            stopping: self.stopping,
            last_error: self.last_error.clone(),
        }
    }
}

/// Everything about a process except its buffered lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub id: ProcessId,
    #[serde(flatten)]
    pub descriptor: ProcessDescriptor,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub started_at: EpochMillis,
    pub ended_at: Option<EpochMillis>,
    pub port: Option<u16>,
    pub total_line_count: u64,
    pub buffered_line_count: usize,
    pub auto_scroll: bool,
    pub stopping: bool,
    pub last_error: Option<String>,
}

impl ProcessSummary {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

//! The process host seam: the only code that touches real OS processes
//! lives behind [`ProcessHost`].

use std::path::PathBuf;
use std::sync::mpsc::Receiver;

use thiserror::Error;

use crate::model::{EpochMillis, OutputStream, ProcessId, ProcessStatus};

pub mod system;

pub use system::SystemProcessHost;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Opaque handle returned by a successful spawn and used to terminate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostHandle {
    pub process_id: ProcessId,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Output {
        process_id: ProcessId,
        content: String,
        stream: OutputStream,
        timestamp: EpochMillis,
    },
    Status {
        process_id: ProcessId,
        status: ProcessStatus,
        exit_code: Option<i32>,
        pid: Option<u32>,
        timestamp: EpochMillis,
    },
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },
    #[error("failed to terminate process {process_id}: {reason}")]
    Terminate {
        process_id: ProcessId,
        reason: String,
    },
    #[error("host event feed already has a subscriber")]
    AlreadySubscribed,
}

/// Spawns and terminates OS processes on behalf of the supervisor and
/// reports everything that happens to them through one event feed.
///
/// Implementations must deliver events for a single process in the order
/// they occurred. No ordering is required across processes.
pub trait ProcessHost: Send + Sync {
    fn spawn(&self, process_id: &ProcessId, spec: &HostSpawnSpec)
        -> Result<HostHandle, HostError>;

    fn terminate(&self, handle: &HostHandle) -> Result<(), HostError>;

    /// Hands out the combined output/status feed. Only one subscriber is
    /// allowed.
    fn subscribe(&self) -> Result<Receiver<HostEvent>, HostError>;
}

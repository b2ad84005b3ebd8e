//! In-memory [`ProcessHost`] for exercising the supervisor without real
//! processes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

use crate::host::{HostError, HostEvent, HostHandle, HostSpawnSpec, ProcessHost};
use crate::model::{now_epoch_ms, OutputStream, ProcessId, ProcessStatus};

const FIRST_FAKE_PID: u32 = 4_000;

/// Records every spawn and terminate call and lets tests inject host
/// events by hand.
///
/// By default a spawn immediately reports `Running` and a terminate
/// immediately reports `Stopped`.
pub struct FakeProcessHost {
    events_tx: Sender<HostEvent>,
    events_rx: Mutex<Option<Receiver<HostEvent>>>,
    next_pid: AtomicU32,
    confirm_terminate: AtomicBool,
    failing_commands: Mutex<HashSet<String>>,
    failing_terminates: Mutex<HashSet<ProcessId>>,
    spawned: Mutex<Vec<(ProcessId, HostSpawnSpec)>>,
    terminated: Mutex<Vec<ProcessId>>,
}

impl Default for FakeProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProcessHost {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            next_pid: AtomicU32::new(FIRST_FAKE_PID),
            confirm_terminate: AtomicBool::new(true),
            failing_commands: Mutex::new(HashSet::new()),
            failing_terminates: Mutex::new(HashSet::new()),
            spawned: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
        }
    }

    /// Every later spawn of `command` fails.
    pub fn fail_spawns_of(&self, command: impl Into<String>) {
        lock(&self.failing_commands).insert(command.into());
    }

    /// Every later terminate of `id` fails.
    pub fn fail_terminate_of(&self, id: &ProcessId) {
        lock(&self.failing_terminates).insert(id.clone());
    }

    /// When false, terminate succeeds but no `Stopped` report follows.
    pub fn set_confirm_terminate(&self, confirm: bool) {
        self.confirm_terminate.store(confirm, Ordering::SeqCst);
    }

    pub fn emit_output(&self, id: &ProcessId, stream: OutputStream, content: impl Into<String>) {
        self.send(HostEvent::Output {
            process_id: id.clone(),
            content: content.into(),
            stream,
            timestamp: now_epoch_ms(),
        });
    }

    pub fn emit_status(&self, id: &ProcessId, status: ProcessStatus, exit_code: Option<i32>) {
        self.send(HostEvent::Status {
            process_id: id.clone(),
            status,
            exit_code,
            pid: None,
            timestamp: now_epoch_ms(),
        });
    }

    pub fn spawned(&self) -> Vec<(ProcessId, HostSpawnSpec)> {
        lock(&self.spawned).clone()
    }

    pub fn terminated(&self) -> Vec<ProcessId> {
        lock(&self.terminated).clone()
    }

    fn send(&self, event: HostEvent) {
        // The receiver only goes away with the supervisor.
        let _ = self.events_tx.send(event);
    }
}

impl ProcessHost for FakeProcessHost {
    fn spawn(
        &self,
        process_id: &ProcessId,
        spec: &HostSpawnSpec,
    ) -> Result<HostHandle, HostError> {
        if lock(&self.failing_commands).contains(&spec.command) {
            return Err(HostError::Spawn {
                command: spec.command.clone(),
                reason: "command not found".to_owned(),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        lock(&self.spawned).push((process_id.clone(), spec.clone()));
        self.send(HostEvent::Status {
            process_id: process_id.clone(),
            status: ProcessStatus::Running,
            exit_code: None,
            pid: Some(pid),
            timestamp: now_epoch_ms(),
        });
        Ok(HostHandle {
            process_id: process_id.clone(),
            pid: Some(pid),
        })
    }

    fn terminate(&self, handle: &HostHandle) -> Result<(), HostError> {
        if lock(&self.failing_terminates).contains(&handle.process_id) {
            return Err(HostError::Terminate {
                process_id: handle.process_id.clone(),
                reason: "operation not permitted".to_owned(),
            });
        }
        lock(&self.terminated).push(handle.process_id.clone());
        if self.confirm_terminate.load(Ordering::SeqCst) {
            self.emit_status(&handle.process_id, ProcessStatus::Stopped, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<Receiver<HostEvent>, HostError> {
        lock(&self.events_rx)
            .take()
            .ok_or(HostError::AlreadySubscribed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

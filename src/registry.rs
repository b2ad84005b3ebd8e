use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{
    self, Receiver, RecvError, RecvTimeoutError, SyncSender, TryRecvError, TrySendError,
};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::host::HostHandle;
use crate::model::{
    BackgroundProcess, EpochMillis, OutputLine, OutputStream, ProcessDescriptor, ProcessId,
    ProcessStatus, ProcessSummary,
};
use crate::output::{detect_port, make_line, DEFAULT_OUTPUT_CAPACITY};

/// Notices a subscriber may have queued before new ones are dropped.
pub const DEFAULT_NOTICE_CAPACITY: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("process {0} is already registered")]
    DuplicateId(ProcessId),
    #[error("process {0} not found")]
    NotFound(ProcessId),
    #[error("process {id} is {status}; only finished processes can be removed")]
    NotTerminal { id: ProcessId, status: ProcessStatus },
    #[error("process {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ProcessId,
        from: ProcessStatus,
        to: ProcessStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Applied,
    /// Same non-terminal status reported again.
    Unchanged,
    /// The entry was already terminal.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub timestamp: EpochMillis,
}

impl StatusChange {
    pub fn new(status: ProcessStatus, timestamp: EpochMillis) -> Self {
        Self {
            status,
            exit_code: None,
            pid: None,
            timestamp,
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }
}

/// Change feed for view layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryNotice {
    Created {
        process_id: ProcessId,
        status: ProcessStatus,
    },
    StatusChanged {
        process_id: ProcessId,
        status: ProcessStatus,
    },
    Output {
        process_id: ProcessId,
        line: OutputLine,
    },
    /// Stop flag, auto-scroll, detected port or last error changed.
    Updated { process_id: ProcessId },
    Removed { process_id: ProcessId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BeginStop {
    Unknown,
    Terminal,
    AlreadyStopping,
    NotSpawned,
    Ready(HostHandle),
}

/// Receiving end of [`ProcessRegistry::subscribe`].
///
/// The queue is bounded. While it is full, new notices are dropped and
/// counted; a consumer that sees a non-zero [`NoticeReceiver::take_dropped`]
/// should re-read the state it cares about from the registry.
pub struct NoticeReceiver {
    rx: Receiver<RegistryNotice>,
    dropped: Arc<AtomicU64>,
}

impl NoticeReceiver {
    pub fn recv(&self) -> Result<RegistryNotice, RecvError> {
        self.rx.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<RegistryNotice, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<RegistryNotice, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn try_iter(&self) -> mpsc::TryIter<'_, RegistryNotice> {
        self.rx.try_iter()
    }

    /// Notices dropped since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::SeqCst)
    }
}

struct Listener {
    tx: SyncSender<RegistryNotice>,
    dropped: Arc<AtomicU64>,
}

struct ProcessSlot {
    entry: Mutex<BackgroundProcess>,
    changed: Condvar,
    removed: AtomicBool,
    /// False while the spawn of a reserved entry is unresolved. Only
    /// written with the entry lock held.
    published: AtomicBool,
}

impl ProcessSlot {
    fn new(entry: BackgroundProcess, published: bool) -> Self {
        Self {
            entry: Mutex::new(entry),
            changed: Condvar::new(),
            removed: AtomicBool::new(false),
            published: AtomicBool::new(published),
        }
    }

    fn is_published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BackgroundProcess> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Authoritative store of supervised processes.
///
/// The id map is behind a `RwLock` that is only held to look up, insert or
/// remove a slot. Each entry has its own mutex, so mutations of one process
/// are serialized while different processes proceed in parallel. Lock order
/// is always map before entry.
pub struct ProcessRegistry {
    slots: RwLock<HashMap<ProcessId, Arc<ProcessSlot>>>,
    output_capacity: usize,
    next_line_id: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_CAPACITY)
    }
}

impl ProcessRegistry {
    pub fn new(output_capacity: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            output_capacity: output_capacity.max(1),
            next_line_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn output_capacity(&self) -> usize {
        self.output_capacity
    }

    pub fn create(
        &self,
        id: ProcessId,
        descriptor: ProcessDescriptor,
        started_at: EpochMillis,
    ) -> Result<(), RegistryError> {
        self.insert(id.clone(), descriptor, started_at, true)?;
        self.notify(RegistryNotice::Created {
            process_id: id,
            status: ProcessStatus::Starting,
        });
        Ok(())
    }

    /// Inserts a Starting entry for a spawn that is still in flight. Host
    /// events for it are applied, but it stays out of every view and notice
    /// until [`attach_handle`](Self::attach_handle) or
    /// [`fail_spawn`](Self::fail_spawn) settles the spawn.
    pub fn reserve(
        &self,
        id: ProcessId,
        descriptor: ProcessDescriptor,
        started_at: EpochMillis,
    ) -> Result<(), RegistryError> {
        self.insert(id, descriptor, started_at, false)
    }

    fn insert(
        &self,
        id: ProcessId,
        descriptor: ProcessDescriptor,
        started_at: EpochMillis,
        published: bool,
    ) -> Result<(), RegistryError> {
        let entry = BackgroundProcess::new(id.clone(), descriptor, started_at, self.output_capacity);
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.entry(id) {
            Entry::Occupied(occupied) => Err(RegistryError::DuplicateId(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(ProcessSlot::new(entry, published)));
                Ok(())
            }
        }
    }

    /// Stores the host handle and publishes a reserved entry with whatever
    /// status it reached meanwhile.
    pub fn attach_handle(&self, id: &ProcessId, handle: HostHandle) -> Result<(), RegistryError> {
        let slot = self.require_slot(id)?;
        let mut entry = slot.lock();
        entry.handle = Some(handle);
        let newly_published = !slot.published.swap(true, Ordering::SeqCst);
        slot.changed.notify_all();
        // Sent under the entry lock so it precedes any later notice for
        // this process.
        if newly_published {
            self.notify(RegistryNotice::Created {
                process_id: id.clone(),
                status: entry.status,
            });
        }
        Ok(())
    }

    /// Moves a process whose host spawn failed straight from Starting to
    /// Failed. No host event can exist for it. A reserved entry is
    /// published as already Failed, so subscribers never see it Starting.
    pub fn fail_spawn(
        &self,
        id: &ProcessId,
        message: impl Into<String>,
        timestamp: EpochMillis,
    ) -> Result<StatusOutcome, RegistryError> {
        let slot = self.require_slot(id)?;
        let mut entry = slot.lock();
        let outcome = transition(
            &mut entry,
            &StatusChange::new(ProcessStatus::Failed, timestamp),
        )?;
        if outcome == StatusOutcome::Applied {
            entry.last_error = Some(message.into());
        }
        let newly_published = !slot.published.swap(true, Ordering::SeqCst);
        slot.changed.notify_all();
        if newly_published {
            self.notify(RegistryNotice::Created {
                process_id: id.clone(),
                status: entry.status,
            });
        } else if outcome == StatusOutcome::Applied {
            self.notify(RegistryNotice::StatusChanged {
                process_id: id.clone(),
                status: ProcessStatus::Failed,
            });
        }
        Ok(outcome)
    }

    /// Validates and applies a status report. Reports for a process that
    /// already finished are absorbed.
    pub fn apply_status(
        &self,
        id: &ProcessId,
        change: StatusChange,
    ) -> Result<StatusOutcome, RegistryError> {
        let slot = self.require_slot(id)?;
        let (outcome, visible) = {
            let mut entry = slot.lock();
            let outcome = transition(&mut entry, &change)?;
            if outcome != StatusOutcome::Ignored {
                slot.changed.notify_all();
            }
            (outcome, slot.is_published())
        };
        if outcome == StatusOutcome::Applied && visible {
            self.notify(RegistryNotice::StatusChanged {
                process_id: id.clone(),
                status: change.status,
            });
        }
        Ok(outcome)
    }

    /// Appends one output line. Returns `false` when the id is unknown.
    ///
    /// Lines that arrive after a terminal status are still taken: hosts may
    /// flush buffered output after reporting the exit.
    pub fn append_output(
        &self,
        id: &ProcessId,
        content: String,
        stream: OutputStream,
        timestamp: EpochMillis,
    ) -> bool {
        let Some(slot) = self.any_slot(id) else {
            return false;
        };
        let line = make_line(
            self.next_line_id.fetch_add(1, Ordering::Relaxed) + 1,
            content,
            stream,
            timestamp,
        );
        let (port_detected, visible) = {
            let mut entry = slot.lock();
            let port_detected = if entry.port.is_none() {
                entry.port = detect_port(&line.content);
                entry.port.is_some()
            } else {
                false
            };
            entry.output.push(line.clone());
            slot.changed.notify_all();
            (port_detected, slot.is_published())
        };
        if !visible {
            return true;
        }
        self.notify(RegistryNotice::Output {
            process_id: id.clone(),
            line,
        });
        if port_detected {
            self.notify(RegistryNotice::Updated {
                process_id: id.clone(),
            });
        }
        true
    }

    pub fn remove(&self, id: &ProcessId) -> Result<BackgroundProcess, RegistryError> {
        let removed = {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            let slot = slots
                .get(id)
                .filter(|slot| slot.is_published())
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
            let entry = slot.lock();
            if entry.status.is_active() {
                return Err(RegistryError::NotTerminal {
                    id: id.clone(),
                    status: entry.status,
                });
            }
            let snapshot = entry.clone();
            slot.removed.store(true, Ordering::SeqCst);
            slot.changed.notify_all();
            drop(entry);
            slots.remove(id);
            snapshot
        };
        self.notify(RegistryNotice::Removed {
            process_id: id.clone(),
        });
        Ok(removed)
    }

    /// Removes every finished process and returns their ids.
    pub fn clear_terminal(&self) -> Vec<ProcessId> {
        let removed = {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            let finished = slots
                .iter()
                .filter(|(_, slot)| slot.is_published() && slot.lock().status.is_terminal())
                .map(|(id, _)| id.clone())
                .collect::<Vec<ProcessId>>();
            for id in &finished {
                if let Some(slot) = slots.remove(id) {
                    slot.removed.store(true, Ordering::SeqCst);
                    slot.changed.notify_all();
                }
            }
            finished
        };
        for id in &removed {
            self.notify(RegistryNotice::Removed {
                process_id: id.clone(),
            });
        }
        removed
    }

    pub fn get(&self, id: &ProcessId) -> Option<BackgroundProcess> {
        self.slot(id).map(|slot| slot.lock().clone())
    }

    pub fn summary(&self, id: &ProcessId) -> Option<ProcessSummary> {
        self.slot(id).map(|slot| slot.lock().summary())
    }

    /// Summaries of every process in unspecified order.
    pub fn summaries(&self) -> Vec<ProcessSummary> {
        self.all_slots()
            .iter()
            .map(|slot| slot.lock().summary())
            .collect()
    }

    pub fn processes_for_conversation(&self, conversation_id: &str) -> Vec<ProcessSummary> {
        self.all_slots()
            .iter()
            .filter_map(|slot| {
                let entry = slot.lock();
                (entry.descriptor.conversation_id.as_deref() == Some(conversation_id))
                    .then(|| entry.summary())
            })
            .collect()
    }

    pub fn output_lines(&self, id: &ProcessId) -> Option<Vec<OutputLine>> {
        self.slot(id).map(|slot| slot.lock().output.to_vec())
    }

    pub fn status(&self, id: &ProcessId) -> Option<ProcessStatus> {
        self.slot(id).map(|slot| slot.lock().status)
    }

    /// True for any known id, including a reserved entry whose spawn is
    /// still in flight. Host events for such an entry must still land.
    pub fn contains(&self, id: &ProcessId) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.is_published())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_auto_scroll(&self, id: &ProcessId, auto_scroll: bool) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        {
            let mut entry = slot.lock();
            if entry.auto_scroll == auto_scroll {
                return true;
            }
            entry.auto_scroll = auto_scroll;
        }
        self.notify(RegistryNotice::Updated {
            process_id: id.clone(),
        });
        true
    }

    /// Marks a live process as stopping and hands back the handle to
    /// terminate. Only one stop may be in flight per process.
    pub(crate) fn begin_stop(&self, id: &ProcessId) -> BeginStop {
        let Some(slot) = self.slot(id) else {
            return BeginStop::Unknown;
        };
        let handle = {
            let mut entry = slot.lock();
            if entry.status.is_terminal() {
                return BeginStop::Terminal;
            }
            if entry.stopping {
                return BeginStop::AlreadyStopping;
            }
            let Some(handle) = entry.handle.clone() else {
                return BeginStop::NotSpawned;
            };
            entry.stopping = true;
            entry.last_error = None;
            slot.changed.notify_all();
            handle
        };
        self.notify(RegistryNotice::Updated {
            process_id: id.clone(),
        });
        BeginStop::Ready(handle)
    }

    /// Clears the stopping flag after a failed or unconfirmed stop. The
    /// status is left untouched.
    pub fn record_stop_failure(&self, id: &ProcessId, message: impl Into<String>) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        {
            let mut entry = slot.lock();
            if entry.status.is_terminal() {
                return false;
            }
            entry.stopping = false;
            entry.last_error = Some(message.into());
            slot.changed.notify_all();
        }
        self.notify(RegistryNotice::Updated {
            process_id: id.clone(),
        });
        true
    }

    /// Blocks until `predicate` holds for the process, the timeout expires,
    /// or the process is removed. `None` timeout waits indefinitely.
    pub fn wait_for<F>(
        &self,
        id: &ProcessId,
        timeout: Option<Duration>,
        mut predicate: F,
    ) -> Option<ProcessSummary>
    where
        F: FnMut(&BackgroundProcess) -> bool,
    {
        let slot = self.slot(id)?;
        let guard = slot.lock();
        let guard = match timeout {
            Some(timeout) => {
                slot.changed
                    .wait_timeout_while(guard, timeout, |entry| {
                        !(slot.removed.load(Ordering::SeqCst) || predicate(entry))
                    })
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => slot
                .changed
                .wait_while(guard, |entry| {
                    !(slot.removed.load(Ordering::SeqCst) || predicate(entry))
                })
                .unwrap_or_else(PoisonError::into_inner),
        };
        if slot.removed.load(Ordering::SeqCst) || !predicate(&*guard) {
            return None;
        }
        Some(guard.summary())
    }

    pub fn wait_for_terminal(
        &self,
        id: &ProcessId,
        timeout: Option<Duration>,
    ) -> Option<ProcessStatus> {
        self.wait_for(id, timeout, |entry| entry.status.is_terminal())
            .map(|summary| summary.status)
    }

    pub fn subscribe(&self) -> NoticeReceiver {
        self.subscribe_with_capacity(DEFAULT_NOTICE_CAPACITY)
    }

    /// Subscribes with room for `capacity` undelivered notices (at least 1).
    pub fn subscribe_with_capacity(&self, capacity: usize) -> NoticeReceiver {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Listener {
                tx,
                dropped: Arc::clone(&dropped),
            });
        NoticeReceiver { rx, dropped }
    }

    /// Never blocks: a full subscriber loses the notice, a closed one is
    /// pruned.
    fn notify(&self, notice: RegistryNotice) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.is_empty() {
            return;
        }
        listeners.retain(|listener| match listener.tx.try_send(notice.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                listener.dropped.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Published entries only.
    fn slot(&self, id: &ProcessId) -> Option<Arc<ProcessSlot>> {
        self.any_slot(id).filter(|slot| slot.is_published())
    }

    fn any_slot(&self, id: &ProcessId) -> Option<Arc<ProcessSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn require_slot(&self, id: &ProcessId) -> Result<Arc<ProcessSlot>, RegistryError> {
        self.any_slot(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    fn all_slots(&self) -> Vec<Arc<ProcessSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.is_published())
            .cloned()
            .collect()
    }
}

fn transition(
    entry: &mut BackgroundProcess,
    change: &StatusChange,
) -> Result<StatusOutcome, RegistryError> {
    let current = entry.status;
    if current.is_terminal() {
        warn!(
            process_id = %entry.id,
            current = %current,
            reported = %change.status,
            "ignoring status report for finished process"
        );
        return Ok(StatusOutcome::Ignored);
    }
    if current == change.status {
        if entry.pid.is_none() && change.pid.is_some() {
            entry.pid = change.pid;
        }
        return Ok(StatusOutcome::Unchanged);
    }
    if !current.can_transition_to(change.status) {
        return Err(RegistryError::InvalidTransition {
            id: entry.id.clone(),
            from: current,
            to: change.status,
        });
    }

    entry.status = change.status;
    if change.status == ProcessStatus::Running && change.pid.is_some() {
        entry.pid = change.pid;
    }
    if change.status.is_terminal() {
        entry.ended_at = Some(change.timestamp);
        entry.exit_code = change.exit_code;
        entry.stopping = false;
    }
    debug!(
        process_id = %entry.id,
        from = %current,
        to = %change.status,
        exit_code = ?change.exit_code,
        "status transition"
    );
    Ok(StatusOutcome::Applied)
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;

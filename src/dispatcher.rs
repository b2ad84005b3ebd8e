use std::io;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::host::HostEvent;
use crate::registry::{ProcessRegistry, StatusChange, StatusOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied,
    /// Event for a process the registry does not know.
    Dropped,
    /// Duplicate or late status report for a finished process.
    Absorbed,
    Rejected,
}

/// Routes host events into the registry. It is the only reader of the
/// host feed.
#[derive(Clone)]
pub struct EventDispatcher {
    registry: Arc<ProcessRegistry>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self { registry }
    }

    pub fn dispatch(&self, event: HostEvent) -> DispatchOutcome {
        match event {
            HostEvent::Output {
                process_id,
                content,
                stream,
                timestamp,
            } => {
                if self
                    .registry
                    .append_output(&process_id, content, stream, timestamp)
                {
                    DispatchOutcome::Applied
                } else {
                    debug!(process_id = %process_id, "dropping output for unknown process");
                    DispatchOutcome::Dropped
                }
            }
            HostEvent::Status {
                process_id,
                status,
                exit_code,
                pid,
                timestamp,
            } => {
                if !self.registry.contains(&process_id) {
                    debug!(process_id = %process_id, %status, "dropping status for unknown process");
                    return DispatchOutcome::Dropped;
                }
                let change = StatusChange::new(status, timestamp)
                    .with_exit_code(exit_code)
                    .with_pid(pid);
                match self.registry.apply_status(&process_id, change) {
                    Ok(StatusOutcome::Applied) | Ok(StatusOutcome::Unchanged) => {
                        DispatchOutcome::Applied
                    }
                    Ok(StatusOutcome::Ignored) => DispatchOutcome::Absorbed,
                    Err(error) => {
                        warn!(%error, "rejected status report from host");
                        DispatchOutcome::Rejected
                    }
                }
            }
        }
    }

    /// Drains `feed` in arrival order until every sender is gone.
    pub fn run(&self, feed: Receiver<HostEvent>) {
        for event in feed {
            self.dispatch(event);
        }
        debug!("host event feed closed");
    }

    pub fn spawn(self, feed: Receiver<HostEvent>) -> io::Result<DispatcherHandle> {
        let join = thread::Builder::new()
            .name("procvisor-dispatch".to_owned())
            .spawn(move || self.run(feed))?;
        Ok(DispatcherHandle { join: Some(join) })
    }
}

/// Owns the dispatcher thread. Dropping it detaches the thread, which ends
/// on its own once the host drops its side of the feed.
#[derive(Debug)]
pub struct DispatcherHandle {
    join: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn is_finished(&self) -> bool {
        self.join
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }

    /// Waits for the thread. Returns `false` if it panicked.
    pub fn join(mut self) -> bool {
        match self.join.take() {
            Some(join) => exited_cleanly(join.join()),
            None => true,
        }
    }
}

fn exited_cleanly(result: thread::Result<()>) -> bool {
    let Err(payload) = result else {
        return true;
    };
    let reason = payload
        .downcast_ref::<&str>()
        .map(|reason| (*reason).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    warn!(%reason, "event dispatcher thread panicked");
    false
}

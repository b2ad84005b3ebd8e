use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::dispatcher::{DispatcherHandle, EventDispatcher};
use crate::host::{HostError, HostSpawnSpec, ProcessHost};
use crate::model::{
    now_epoch_ms, BackgroundProcess, ProcessDescriptor, ProcessId, ProcessStatus, SpawnRequest,
};
use crate::registry::{BeginStop, ProcessRegistry, RegistryError};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to subscribe to host events: {0}")]
    Subscribe(#[from] HostError),
    #[error("failed to start event dispatcher: {0}")]
    Dispatcher(#[from] std::io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("invalid spawn request: {0}")]
    InvalidRequest(String),
    /// The host refused to start the process. A Failed entry with this
    /// message stays in the registry under `process_id`.
    #[error("process {process_id} failed to start: {message}")]
    Host {
        process_id: ProcessId,
        message: String,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StopError {
    #[error("process {0} not found")]
    Unknown(ProcessId),
    #[error("process {0} already finished")]
    Finished(ProcessId),
    #[error("process {0} is already stopping")]
    AlreadyStopping(ProcessId),
    #[error("process {0} has no host handle yet")]
    NotSpawned(ProcessId),
    #[error("host failed to terminate process {process_id}: {message}")]
    Host {
        process_id: ProcessId,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopAllReport {
    /// Terminate was issued; confirmation arrives through the event feed.
    pub requested: Vec<ProcessId>,
    /// Nothing to terminate by the time the request ran: finished, already
    /// stopping, or never spawned by the host.
    pub skipped: Vec<ProcessId>,
    pub failed: Vec<(ProcessId, String)>,
}

impl StopAllReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Public operation surface over a [`ProcessHost`].
///
/// Status only ever changes through the host event feed; the supervisor
/// creates entries and requests termination.
pub struct ProcessSupervisor {
    host: Arc<dyn ProcessHost>,
    registry: Arc<ProcessRegistry>,
    config: SupervisorConfig,
    _dispatcher: DispatcherHandle,
}

impl ProcessSupervisor {
    pub fn start(
        host: Arc<dyn ProcessHost>,
        config: SupervisorConfig,
    ) -> Result<Self, SupervisorError> {
        let feed = host.subscribe()?;
        let registry = Arc::new(ProcessRegistry::new(config.output_capacity));
        let dispatcher = EventDispatcher::new(Arc::clone(&registry)).spawn(feed)?;
        Ok(Self {
            host,
            registry,
            config,
            _dispatcher: dispatcher,
        })
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn get_process(&self, id: &ProcessId) -> Option<BackgroundProcess> {
        self.registry.get(id)
    }

    pub fn spawn_process(&self, request: SpawnRequest) -> Result<ProcessId, SpawnError> {
        validate_request(&request)?;

        let id = ProcessId::generate();
        // Reserved before the host runs so no early event is lost. It stays
        // hidden until the spawn outcome is known.
        self.registry.reserve(
            id.clone(),
            ProcessDescriptor::from(&request),
            now_epoch_ms(),
        )?;

        let spec = HostSpawnSpec {
            command: request.command.clone(),
            args: request.args.clone(),
            cwd: request.cwd.clone(),
            env: request.env.clone(),
        };
        match self.host.spawn(&id, &spec) {
            Ok(handle) => {
                self.registry.attach_handle(&id, handle)?;
                info!(process_id = %id, name = %request.name, command = %request.command, "spawned background process");
                Ok(id)
            }
            Err(error) => {
                let message = error.to_string();
                warn!(process_id = %id, name = %request.name, %message, "host failed to spawn process");
                self.registry.fail_spawn(&id, message.clone(), now_epoch_ms())?;
                Err(SpawnError::Host {
                    process_id: id,
                    message,
                })
            }
        }
    }

    /// Asks the host to terminate `id` without waiting for confirmation.
    pub fn request_stop(&self, id: &ProcessId) -> Result<(), StopError> {
        let handle = match self.registry.begin_stop(id) {
            BeginStop::Ready(handle) => handle,
            BeginStop::Unknown => return Err(StopError::Unknown(id.clone())),
            BeginStop::Terminal => return Err(StopError::Finished(id.clone())),
            BeginStop::AlreadyStopping => return Err(StopError::AlreadyStopping(id.clone())),
            BeginStop::NotSpawned => return Err(StopError::NotSpawned(id.clone())),
        };
        if let Err(error) = self.host.terminate(&handle) {
            let message = error.to_string();
            warn!(process_id = %id, %message, "host failed to terminate process");
            self.registry.record_stop_failure(id, message.clone());
            return Err(StopError::Host {
                process_id: id.clone(),
                message,
            });
        }
        debug!(process_id = %id, "terminate requested");
        Ok(())
    }

    /// Requests termination and waits until the registry records a
    /// terminal status. `false` for unknown, finished or already-stopping
    /// processes, host failures, and unconfirmed stops.
    pub fn stop_process(&self, id: &ProcessId) -> bool {
        if let Err(error) = self.request_stop(id) {
            debug!(%error, "stop request not issued");
            return false;
        }
        let timeout = self.config.stop_confirm_timeout();
        match self.registry.wait_for_terminal(id, timeout) {
            Some(status) => {
                info!(process_id = %id, %status, "background process stopped");
                true
            }
            None if !self.registry.contains(id) => false,
            None => {
                let waited_ms = self.config.stop_confirm_timeout_ms;
                warn!(process_id = %id, waited_ms, "host did not confirm termination");
                self.registry.record_stop_failure(
                    id,
                    format!("termination not confirmed after {waited_ms}ms"),
                );
                false
            }
        }
    }

    /// Issues a stop request for every live process in parallel. One failed
    /// request never prevents the others.
    pub fn stop_all_processes(&self) -> StopAllReport {
        let targets = self
            .registry
            .summaries()
            .into_iter()
            .filter(|summary| summary.status.is_active())
            .map(|summary| summary.id)
            .collect::<Vec<ProcessId>>();

        let results = thread::scope(|scope| {
            let pending = targets
                .iter()
                .map(|id| (id, scope.spawn(move || self.request_stop(id))))
                .collect::<Vec<_>>();
            pending
                .into_iter()
                .map(|(id, pending)| {
                    let result = pending.join().unwrap_or_else(|_| {
                        Err(StopError::Host {
                            process_id: id.clone(),
                            message: "stop request panicked".to_owned(),
                        })
                    });
                    (id.clone(), result)
                })
                .collect::<Vec<_>>()
        });

        let mut report = StopAllReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.requested.push(id),
                // Nothing left to terminate.
                Err(StopError::Unknown(_))
                | Err(StopError::Finished(_))
                | Err(StopError::AlreadyStopping(_))
                | Err(StopError::NotSpawned(_)) => report.skipped.push(id),
                Err(error) => report.failed.push((id, error.to_string())),
            }
        }
        info!(
            requested = report.requested.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "stop-all issued"
        );
        report
    }

    pub fn remove_process(&self, id: &ProcessId) -> Result<(), RegistryError> {
        self.registry.remove(id)?;
        info!(process_id = %id, "removed background process");
        Ok(())
    }

    pub fn clear_completed_processes(&self) -> Vec<ProcessId> {
        let removed = self.registry.clear_terminal();
        if !removed.is_empty() {
            info!(count = removed.len(), "cleared finished processes");
        }
        removed
    }

    pub fn running_ids(&self) -> Vec<ProcessId> {
        self.registry
            .summaries()
            .into_iter()
            .filter(|summary| summary.status == ProcessStatus::Running)
            .map(|summary| summary.id)
            .collect()
    }
}

fn validate_request(request: &SpawnRequest) -> Result<(), SpawnError> {
    if request.name.trim().is_empty() {
        return Err(SpawnError::InvalidRequest("name must not be empty".to_owned()));
    }
    if request.command.trim().is_empty() {
        return Err(SpawnError::InvalidRequest(
            "command must not be empty".to_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_name_or_command_is_invalid() {
        assert!(matches!(
            validate_request(&SpawnRequest::new("  ", "npm")),
            Err(SpawnError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_request(&SpawnRequest::new("web", "")),
            Err(SpawnError::InvalidRequest(_))
        ));
        assert!(validate_request(&SpawnRequest::new("web", "npm")).is_ok());
    }

    #[test]
    fn report_is_clean_without_failures() {
        let mut report = StopAllReport::default();
        assert!(report.is_clean());
        report
            .failed
            .push((ProcessId::new("a"), "boom".to_owned()));
        assert!(!report.is_clean());
    }
}

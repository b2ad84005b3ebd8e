use std::collections::HashMap;
use std::io::{BufRead, BufReader, ErrorKind, Read};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command as ProcessCommand, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::{setpgid, Pid};
use tracing::{debug, warn};

use super::{HostError, HostEvent, HostHandle, HostSpawnSpec, ProcessHost};
use crate::model::{now_epoch_ms, OutputStream, ProcessId, ProcessStatus};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(40);

struct ManagedChild {
    child: Arc<Mutex<Child>>,
    stop_requested: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

type ChildTable = Arc<Mutex<HashMap<ProcessId, ManagedChild>>>;

/// Runs processes with `std::process`, one reader thread per pipe and one
/// waiter thread per child. A child leaves the table once its final status
/// is sent.
pub struct SystemProcessHost {
    children: ChildTable,
    events_tx: Sender<HostEvent>,
    events_rx: Mutex<Option<Receiver<HostEvent>>>,
}

impl Default for SystemProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProcessHost {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel::<HostEvent>();
        Self {
            children: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Children whose final status has not been reported yet.
    pub fn managed_count(&self) -> usize {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ProcessHost for SystemProcessHost {
    fn spawn(
        &self,
        process_id: &ProcessId,
        spec: &HostSpawnSpec,
    ) -> Result<HostHandle, HostError> {
        let mut child = build_command(spec)
            .spawn()
            .map_err(|error| HostError::Spawn {
                command: spec.command.clone(),
                reason: error.to_string(),
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HostError::Spawn {
                command: spec.command.clone(),
                reason: "missing stdout/stderr pipe".to_owned(),
            });
        };

        let pid = child.id();
        // Running goes out before any reader starts so it precedes output.
        let _ = self.events_tx.send(HostEvent::Status {
            process_id: process_id.clone(),
            status: ProcessStatus::Running,
            exit_code: None,
            pid: Some(pid),
            timestamp: now_epoch_ms(),
        });

        let readers = vec![
            spawn_reader(
                process_id.clone(),
                stdout,
                OutputStream::Stdout,
                self.events_tx.clone(),
            ),
            spawn_reader(
                process_id.clone(),
                stderr,
                OutputStream::Stderr,
                self.events_tx.clone(),
            ),
        ];

        let managed = ManagedChild {
            child: Arc::new(Mutex::new(child)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
        };
        // Inserted before the waiter starts so its removal cannot run first.
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        spawn_waiter(
            process_id.clone(),
            &managed,
            readers,
            self.events_tx.clone(),
            Arc::clone(&self.children),
        );
        children.insert(process_id.clone(), managed);
        drop(children);

        debug!(process_id = %process_id, pid, command = %spec.command, "spawned child");
        Ok(HostHandle {
            process_id: process_id.clone(),
            pid: Some(pid),
        })
    }

    fn terminate(&self, handle: &HostHandle) -> Result<(), HostError> {
        let children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(managed) = children.get(&handle.process_id) else {
            // Handles only come from this host, so a missing entry has
            // already exited and reported.
            debug!(process_id = %handle.process_id, "terminate after exit");
            return Ok(());
        };
        if managed.finished.load(Ordering::SeqCst) {
            // The final status event is already on its way.
            return Ok(());
        }
        managed.stop_requested.store(true, Ordering::SeqCst);
        let mut child = managed.child.lock().unwrap_or_else(PoisonError::into_inner);
        match signal_terminate(&mut child) {
            Ok(()) => Ok(()),
            Err(_) if managed.finished.load(Ordering::SeqCst) => Ok(()),
            Err(reason) => Err(HostError::Terminate {
                process_id: handle.process_id.clone(),
                reason,
            }),
        }
    }

    fn subscribe(&self) -> Result<Receiver<HostEvent>, HostError> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(HostError::AlreadySubscribed)
    }
}

fn spawn_reader<R>(
    process_id: ProcessId,
    pipe: R,
    stream: OutputStream,
    tx: Sender<HostEvent>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) => break,
                Ok(_) => {
                    if raw.last() == Some(&b'\n') {
                        raw.pop();
                    }
                    let sent = tx.send(HostEvent::Output {
                        process_id: process_id.clone(),
                        content: String::from_utf8_lossy(&raw).into_owned(),
                        stream,
                        timestamp: now_epoch_ms(),
                    });
                    if sent.is_err() {
                        break;
                    }
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    debug!(process_id = %process_id, %error, "output pipe closed with error");
                    break;
                }
            }
        }
    })
}

fn spawn_waiter(
    process_id: ProcessId,
    managed: &ManagedChild,
    readers: Vec<JoinHandle<()>>,
    tx: Sender<HostEvent>,
    children: ChildTable,
) {
    let child = Arc::clone(&managed.child);
    let stop_requested = Arc::clone(&managed.stop_requested);
    let finished = Arc::clone(&managed.finished);
    thread::spawn(move || {
        let outcome = loop {
            let status = child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_wait();
            match status {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                Err(error) => break Err(error),
            }
        };
        finished.store(true, Ordering::SeqCst);
        // Drain the pipes first so every line lands before the final status.
        for reader in readers {
            let _ = reader.join();
        }
        let (status, exit_code) = match outcome {
            Ok(status) => classify_exit(status, stop_requested.load(Ordering::SeqCst)),
            Err(error) => {
                warn!(process_id = %process_id, %error, "failed waiting on child");
                (ProcessStatus::Failed, None)
            }
        };
        let _ = tx.send(HostEvent::Status {
            process_id: process_id.clone(),
            status,
            exit_code,
            pid: None,
            timestamp: now_epoch_ms(),
        });
        children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&process_id);
    });
}

/// Maps an OS exit status onto a terminal status and exit code.
pub(crate) fn classify_exit(
    status: ExitStatus,
    stop_requested: bool,
) -> (ProcessStatus, Option<i32>) {
    if let Some(code) = status.code() {
        if code == 0 {
            return (ProcessStatus::Completed, Some(0));
        }
        if stop_requested {
            return (ProcessStatus::Stopped, Some(code));
        }
        return (ProcessStatus::Failed, Some(code));
    }
    #[cfg(unix)]
    {
        if let Some(signal) = status.signal() {
            if stop_requested {
                return (ProcessStatus::Stopped, None);
            }
            return (ProcessStatus::Failed, Some(128 + signal));
        }
    }
    if stop_requested {
        (ProcessStatus::Stopped, None)
    } else {
        (ProcessStatus::Failed, None)
    }
}

fn build_command(spec: &HostSpawnSpec) -> ProcessCommand {
    let mut process = ProcessCommand::new(&spec.command);
    process
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if !spec.cwd.as_os_str().is_empty() {
        process.current_dir(&spec.cwd);
        with_local_node_bin_path(&mut process, &spec.cwd);
    }
    process.envs(spec.env.iter().map(|(key, value)| (key, value)));
    #[cfg(unix)]
    unsafe {
        process.pre_exec(|| {
            setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(|error| std::io::Error::new(ErrorKind::Other, error.to_string()))
        });
    }
    process
}

fn with_local_node_bin_path(process: &mut ProcessCommand, cwd: &Path) {
    let local_bin = cwd.join("node_modules/.bin");
    if !local_bin.is_dir() {
        return;
    }
    let local_rendered = local_bin.display().to_string();
    let merged = match std::env::var("PATH") {
        Ok(path) if !path.is_empty() => format!("{local_rendered}:{path}"),
        _ => local_rendered,
    };
    process.env("PATH", merged);
}

#[cfg(unix)]
fn signal_terminate(child: &mut Child) -> Result<(), String> {
    let pid = child.id() as i32;
    if pid <= 0 {
        return Ok(());
    }
    kill(Pid::from_raw(-pid), Signal::SIGTERM).map_err(|error| error.to_string())
}

#[cfg(not(unix))]
fn signal_terminate(child: &mut Child) -> Result<(), String> {
    child.kill().map_err(|error| error.to_string())
}

use pretty_assertions::assert_eq;
use procvisor::model::ProcessDescriptor;
use procvisor::registry::RegistryError;
use procvisor::testing::FakeProcessHost;
use procvisor::{
    OutputStream, ProcessId, ProcessStatus, ProcessSupervisor, RegistryNotice, SpawnError,
    SpawnRequest, SupervisorConfig,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn start_with(config: SupervisorConfig) -> (Arc<FakeProcessHost>, ProcessSupervisor) {
    let host = Arc::new(FakeProcessHost::new());
    let supervisor = ProcessSupervisor::start(host.clone(), config).expect("start supervisor");
    (host, supervisor)
}

fn start() -> (Arc<FakeProcessHost>, ProcessSupervisor) {
    start_with(SupervisorConfig::default())
}

fn spawn_running(supervisor: &ProcessSupervisor, name: &str) -> ProcessId {
    let id = supervisor
        .spawn_process(SpawnRequest::new(name, "npm").with_args(["run", "dev"]))
        .expect("spawn");
    supervisor
        .registry()
        .wait_for(&id, WAIT, |entry| entry.status == ProcessStatus::Running)
        .expect("process should report running");
    id
}

#[test]
fn spawn_records_pid_from_running_report() {
    let (host, supervisor) = start();
    let id = spawn_running(&supervisor, "web");

    let entry = supervisor.get_process(&id).expect("entry");
    assert_eq!(entry.status, ProcessStatus::Running);
    assert_eq!(entry.pid, Some(4_000));
    assert_eq!(entry.name(), "web");

    let spawned = host.spawned();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].0, id);
    assert_eq!(spawned[0].1.command, "npm");
    assert_eq!(spawned[0].1.args, vec!["run".to_owned(), "dev".to_owned()]);
}

#[test]
fn blank_requests_are_rejected_without_an_entry() {
    let (host, supervisor) = start();
    let err = supervisor
        .spawn_process(SpawnRequest::new("web", "   "))
        .expect_err("blank command");
    assert!(matches!(err, SpawnError::InvalidRequest(_)));
    assert!(supervisor.registry().is_empty());
    assert!(host.spawned().is_empty());
}

#[test]
fn host_spawn_failure_leaves_a_failed_entry() {
    let (host, supervisor) = start();
    host.fail_spawns_of("missing-binary");

    let err = supervisor
        .spawn_process(SpawnRequest::new("ghost", "missing-binary"))
        .expect_err("host failure");
    let SpawnError::Host {
        process_id,
        message,
    } = err
    else {
        panic!("expected host error, got {err:?}");
    };
    assert!(message.contains("command not found"));

    let entry = supervisor.get_process(&process_id).expect("failed entry");
    assert_eq!(entry.status, ProcessStatus::Failed);
    assert_eq!(entry.last_error.as_deref(), Some(message.as_str()));
    assert!(entry.ended_at.is_some());
}

#[test]
fn failed_spawn_is_announced_only_as_failed() {
    let (host, supervisor) = start();
    host.fail_spawns_of("missing-binary");
    let notices = supervisor.registry().subscribe();

    let err = supervisor
        .spawn_process(SpawnRequest::new("ghost", "missing-binary"))
        .expect_err("host failure");
    let SpawnError::Host { process_id, .. } = err else {
        panic!("expected host error, got {err:?}");
    };

    assert_eq!(
        notices.try_iter().collect::<Vec<RegistryNotice>>(),
        vec![RegistryNotice::Created {
            process_id,
            status: ProcessStatus::Failed,
        }]
    );
}

#[test]
fn stop_is_idempotent() {
    let (host, supervisor) = start();
    let id = spawn_running(&supervisor, "web");

    assert!(supervisor.stop_process(&id));
    assert_eq!(supervisor.registry().status(&id), Some(ProcessStatus::Stopped));
    assert!(!supervisor.stop_process(&id));
    assert_eq!(host.terminated(), vec![id.clone()]);
    assert!(!supervisor.get_process(&id).expect("entry").stopping);
}

#[test]
fn stop_of_unknown_process_returns_false() {
    let (host, supervisor) = start();
    assert!(!supervisor.stop_process(&ProcessId::new("nope")));
    assert!(host.terminated().is_empty());
}

#[test]
fn host_terminate_failure_clears_stopping_and_records_error() {
    let (host, supervisor) = start();
    let id = spawn_running(&supervisor, "web");
    host.fail_terminate_of(&id);

    assert!(!supervisor.stop_process(&id));
    let entry = supervisor.get_process(&id).expect("entry");
    assert_eq!(entry.status, ProcessStatus::Running);
    assert!(!entry.stopping);
    assert!(entry
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("operation not permitted"));
}

#[test]
fn unconfirmed_stop_times_out_without_forcing_status() {
    let (host, supervisor) = start_with(SupervisorConfig {
        stop_confirm_timeout_ms: 100,
        ..SupervisorConfig::default()
    });
    host.set_confirm_terminate(false);
    let id = spawn_running(&supervisor, "web");

    assert!(!supervisor.stop_process(&id));
    let entry = supervisor.get_process(&id).expect("entry");
    assert_eq!(entry.status, ProcessStatus::Running);
    assert!(!entry.stopping);
    assert!(entry.last_error.is_some());

    // A later confirmation still lands and the stop can be retried.
    host.set_confirm_terminate(true);
    assert!(supervisor.stop_process(&id));
    assert_eq!(host.terminated().len(), 2);
}

#[test]
fn stop_all_isolates_a_failing_process() {
    let (host, supervisor) = start();
    let first = spawn_running(&supervisor, "one");
    let second = spawn_running(&supervisor, "two");
    let third = spawn_running(&supervisor, "three");
    host.fail_terminate_of(&second);

    let report = supervisor.stop_all_processes();
    let mut requested = report.requested.clone();
    requested.sort();
    let mut expected = vec![first.clone(), third.clone()];
    expected.sort();
    assert_eq!(requested, expected);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, second);
    assert!(!report.is_clean());

    let registry = supervisor.registry();
    assert_eq!(
        registry.wait_for_terminal(&first, WAIT),
        Some(ProcessStatus::Stopped)
    );
    assert_eq!(
        registry.wait_for_terminal(&third, WAIT),
        Some(ProcessStatus::Stopped)
    );
    assert_eq!(registry.status(&second), Some(ProcessStatus::Running));
}

#[test]
fn stop_all_skips_finished_processes() {
    let (host, supervisor) = start();
    let done = spawn_running(&supervisor, "done");
    host.emit_status(&done, ProcessStatus::Completed, Some(0));
    supervisor
        .registry()
        .wait_for_terminal(&done, WAIT)
        .expect("completed");

    let report = supervisor.stop_all_processes();
    assert!(report.requested.is_empty());
    assert!(report.failed.is_empty());
    assert!(host.terminated().is_empty());
}

#[test]
fn stop_all_skips_entries_without_a_host_handle() {
    let (host, supervisor) = start();
    let live = spawn_running(&supervisor, "live");
    let unspawned = ProcessId::new("unspawned");
    supervisor
        .registry()
        .create(
            unspawned.clone(),
            ProcessDescriptor::from(&SpawnRequest::new("unspawned", "npm")),
            1,
        )
        .expect("create");

    let report = supervisor.stop_all_processes();
    assert_eq!(report.requested, vec![live.clone()]);
    assert_eq!(report.skipped, vec![unspawned]);
    assert!(report.is_clean());
    assert_eq!(host.terminated(), vec![live]);
}

#[test]
fn remove_requires_a_terminal_status() {
    let (_host, supervisor) = start();
    let id = spawn_running(&supervisor, "web");

    let err = supervisor.remove_process(&id).expect_err("still running");
    assert!(matches!(err, RegistryError::NotTerminal { .. }));

    assert!(supervisor.stop_process(&id));
    supervisor.remove_process(&id).expect("remove");
    assert!(supervisor.get_process(&id).is_none());
}

#[test]
fn clear_completed_keeps_live_processes() {
    let (host, supervisor) = start();
    let live = spawn_running(&supervisor, "live");
    let done = spawn_running(&supervisor, "done");
    host.emit_status(&done, ProcessStatus::Completed, Some(0));
    supervisor
        .registry()
        .wait_for_terminal(&done, WAIT)
        .expect("completed");

    assert_eq!(supervisor.clear_completed_processes(), vec![done.clone()]);
    assert!(supervisor.get_process(&done).is_none());
    assert_eq!(supervisor.running_ids(), vec![live]);
}

#[test]
fn output_is_bounded_by_configured_capacity() {
    let (host, supervisor) = start_with(SupervisorConfig {
        output_capacity: 5,
        ..SupervisorConfig::default()
    });
    let id = spawn_running(&supervisor, "web");
    for idx in 0..8 {
        host.emit_output(&id, OutputStream::Stdout, format!("line-{idx}"));
    }
    host.emit_output(&id, OutputStream::Stderr, "listening on http://localhost:5173");

    let summary = supervisor
        .registry()
        .wait_for(&id, WAIT, |entry| entry.output.total_line_count() == 9)
        .expect("all lines counted");
    assert_eq!(summary.buffered_line_count, 5);
    assert_eq!(summary.port, Some(5173));

    let lines = supervisor
        .registry()
        .output_lines(&id)
        .expect("lines")
        .into_iter()
        .map(|line| line.content)
        .collect::<Vec<String>>();
    assert_eq!(
        lines,
        vec![
            "line-4".to_owned(),
            "line-5".to_owned(),
            "line-6".to_owned(),
            "line-7".to_owned(),
            "listening on http://localhost:5173".to_owned(),
        ]
    );
}

#[test]
fn conversation_lookup_finds_tagged_processes() {
    let (_host, supervisor) = start();
    let tagged = supervisor
        .spawn_process(
            SpawnRequest::new("web", "npm").with_conversation("conv-1", Some("msg-9".to_owned())),
        )
        .expect("spawn");
    supervisor
        .spawn_process(SpawnRequest::new("other", "npm"))
        .expect("spawn");

    let found = supervisor.registry().processes_for_conversation("conv-1");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, tagged);
}

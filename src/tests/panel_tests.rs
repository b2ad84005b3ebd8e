use super::{
    JsonFileStore, KeyValueStore, ListenerId, MemoryStore, PanelState, PanelViewModel,
    PointerCapture, StoreError,
};
use crate::config::PanelConfig;
use crate::model::{ProcessDescriptor, ProcessId, ProcessStatus, SpawnRequest};
use crate::registry::{ProcessRegistry, StatusChange};
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

struct FailingStore;

impl KeyValueStore for FailingStore {
    fn load(&self, _key: &str) -> Result<Option<i64>, StoreError> {
        Err(StoreError::Unavailable("disk full".to_owned()))
    }

    fn save(&self, _key: &str, _value: i64) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".to_owned()))
    }
}

#[derive(Default)]
struct RecordingCapture {
    next: RefCell<u64>,
    attached: RefCell<Vec<ListenerId>>,
    detached: RefCell<Vec<ListenerId>>,
}

impl PointerCapture for RecordingCapture {
    fn attach(&self) -> ListenerId {
        let mut next = self.next.borrow_mut();
        *next += 1;
        let id = ListenerId(*next);
        self.attached.borrow_mut().push(id);
        id
    }

    fn detach(&self, listener: ListenerId) {
        self.detached.borrow_mut().push(listener);
    }
}

fn add(registry: &ProcessRegistry, id: &str, started_at: u64) -> ProcessId {
    let id = ProcessId::new(id);
    registry
        .create(
            id.clone(),
            ProcessDescriptor::from(&SpawnRequest::new(id.as_str(), "npm")),
            started_at,
        )
        .expect("create");
    id
}

fn set_status(registry: &ProcessRegistry, id: &ProcessId, status: ProcessStatus) {
    registry
        .apply_status(id, StatusChange::new(status, 1_000))
        .expect("status");
}

fn panel_with(registry: &Arc<ProcessRegistry>, store: Box<dyn KeyValueStore>) -> PanelViewModel {
    PanelViewModel::new(Arc::clone(registry), store, PanelConfig::default())
}

fn ids(panel: &PanelViewModel) -> Vec<String> {
    panel
        .process_list()
        .into_iter()
        .map(|summary| summary.id.as_str().to_owned())
        .collect()
}

#[test]
fn process_list_orders_newest_first() {
    let registry = Arc::new(ProcessRegistry::new(8));
    add(&registry, "A", 100);
    add(&registry, "B", 200);
    let panel = panel_with(&registry, Box::new(MemoryStore::new()));
    assert_eq!(ids(&panel), vec!["B", "A"]);
}

#[test]
fn process_list_breaks_ties_by_id() {
    let registry = Arc::new(ProcessRegistry::new(8));
    add(&registry, "c", 100);
    add(&registry, "a", 100);
    add(&registry, "b", 300);
    let panel = panel_with(&registry, Box::new(MemoryStore::new()));
    assert_eq!(ids(&panel), vec!["b", "a", "c"]);
}

#[test]
fn counts_split_live_and_finished_entries() {
    let registry = Arc::new(ProcessRegistry::new(8));
    let a = add(&registry, "a", 1);
    let b = add(&registry, "b", 2);
    let c = add(&registry, "c", 3);
    add(&registry, "d", 4);
    set_status(&registry, &a, ProcessStatus::Running);
    set_status(&registry, &b, ProcessStatus::Running);
    set_status(&registry, &b, ProcessStatus::Completed);
    set_status(&registry, &c, ProcessStatus::Failed);

    let panel = panel_with(&registry, Box::new(MemoryStore::new()));
    assert_eq!(panel.running_count(), 2);
    assert_eq!(panel.completed_count(), 2);
}

#[test]
fn height_defaults_and_clamps_stored_values() {
    let registry = Arc::new(ProcessRegistry::new(8));
    let panel = panel_with(&registry, Box::new(MemoryStore::new()));
    assert_eq!(panel.height(), 300);

    let key = PanelConfig::default().height_key;
    let panel = panel_with(&registry, Box::new(MemoryStore::with_value(key, 900)));
    assert_eq!(panel.height(), 500);
}

#[test]
fn set_height_clamps_to_bounds() {
    let registry = Arc::new(ProcessRegistry::new(8));
    let mut panel = panel_with(&registry, Box::new(MemoryStore::new()));
    assert_eq!(panel.set_height(650), 500);
    assert_eq!(panel.height(), 500);
    assert_eq!(panel.set_height(50), 200);
    assert_eq!(panel.height(), 200);
}

#[test]
fn inverted_height_bounds_still_clamp() {
    let registry = Arc::new(ProcessRegistry::new(8));
    let config = PanelConfig {
        min_height: 500,
        max_height: 200,
        ..PanelConfig::default()
    };
    let key = config.height_key.clone();
    let mut panel = PanelViewModel::new(
        Arc::clone(&registry),
        Box::new(MemoryStore::with_value(key, 900)),
        config,
    );
    assert_eq!(panel.height(), 500);
    assert_eq!(panel.set_height(50), 200);
    assert_eq!(panel.set_height(320), 320);
}

#[test]
fn reserved_entries_stay_out_of_the_panel() {
    let registry = Arc::new(ProcessRegistry::new(8));
    add(&registry, "visible", 1);
    let pending = ProcessId::new("pending");
    registry
        .reserve(
            pending.clone(),
            ProcessDescriptor::from(&SpawnRequest::new("pending", "node")),
            2,
        )
        .expect("reserve");

    let mut panel = panel_with(&registry, Box::new(MemoryStore::new()));
    assert_eq!(ids(&panel), vec!["visible"]);
    assert_eq!(panel.running_count(), 1);
    assert!(!panel.select_process(&pending));
}

#[test]
fn persistence_failures_are_swallowed() {
    let registry = Arc::new(ProcessRegistry::new(8));
    let mut panel = panel_with(&registry, Box::new(FailingStore));
    assert_eq!(panel.height(), 300);
    assert_eq!(panel.set_height(420), 420);
    assert_eq!(panel.height(), 420);
}

#[test]
fn height_survives_a_new_view_model() {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    let path = std::env::temp_dir()
        .join(format!("procvisor-panel-{ts}"))
        .join("prefs.json");
    let registry = Arc::new(ProcessRegistry::new(8));

    let mut panel = panel_with(&registry, Box::new(JsonFileStore::new(&path)));
    panel.set_height(333);

    let reopened = panel_with(&registry, Box::new(JsonFileStore::new(&path)));
    assert_eq!(reopened.height(), 333);
    let stored = JsonFileStore::new(&path)
        .load(&PanelConfig::default().height_key)
        .expect("load");
    assert_eq!(stored, Some(333));
}

#[test]
fn stale_selection_resets_to_none() {
    let registry = Arc::new(ProcessRegistry::new(8));
    let a = add(&registry, "a", 1);
    let mut panel = panel_with(&registry, Box::new(MemoryStore::new()));

    assert!(!panel.select_process(&ProcessId::new("ghost")));
    assert!(panel.select_process(&a));
    assert_eq!(panel.selected_process_id(), Some(a.clone()));

    set_status(&registry, &a, ProcessStatus::Failed);
    registry.remove(&a).expect("remove");
    assert_eq!(panel.selected_process_id(), None);
    assert!(panel.selected_process().is_none());
}

#[test]
fn toggle_collapsed_round_trips_through_expanded() {
    let registry = Arc::new(ProcessRegistry::new(8));
    let mut panel = panel_with(&registry, Box::new(MemoryStore::new()));
    assert_eq!(panel.state(), PanelState::Expanded);
    assert_eq!(panel.toggle_collapsed(), PanelState::Collapsed);
    assert_eq!(panel.toggle_collapsed(), PanelState::Expanded);
    panel.set_state(PanelState::Maximized);
    assert_eq!(panel.toggle_collapsed(), PanelState::Collapsed);
}

#[test]
fn dragging_up_grows_the_panel() {
    let registry = Arc::new(ProcessRegistry::new(8));
    let mut panel = panel_with(&registry, Box::new(MemoryStore::new()));
    let capture = RecordingCapture::default();

    let mut gesture = panel.begin_resize(600, &capture);
    assert_eq!(gesture.pointer_moved(560), 340);
    assert_eq!(gesture.pointer_moved(700), 200);
    assert_eq!(gesture.pointer_moved(200), 500);
    assert_eq!(gesture.release(), 500);

    assert_eq!(panel.height(), 500);
    assert_eq!(*capture.attached.borrow(), vec![ListenerId(1)]);
    assert_eq!(*capture.detached.borrow(), vec![ListenerId(1)]);
}

#[test]
fn dropping_a_gesture_detaches_listeners_once() {
    let registry = Arc::new(ProcessRegistry::new(8));
    let mut panel = panel_with(&registry, Box::new(MemoryStore::new()));
    let capture = RecordingCapture::default();

    for _ in 0..3 {
        let mut gesture = panel.begin_resize(400, &capture);
        gesture.pointer_moved(390);
    }

    assert_eq!(capture.attached.borrow().len(), 3);
    assert_eq!(
        *capture.detached.borrow(),
        vec![ListenerId(1), ListenerId(2), ListenerId(3)]
    );
    assert_eq!(panel.height(), 330);
}

#[test]
fn auto_scroll_routes_to_the_registry() {
    let registry = Arc::new(ProcessRegistry::new(8));
    let a = add(&registry, "a", 1);
    let panel = panel_with(&registry, Box::new(MemoryStore::new()));
    assert!(panel.set_auto_scroll(&a, false));
    assert!(!registry.get(&a).expect("entry").auto_scroll);
    assert!(!panel.set_auto_scroll(&ProcessId::new("ghost"), false));
}

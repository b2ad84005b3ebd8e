//! View-model backing the background process panel: ordering, counts,
//! selection, collapse state and a persisted, clamped height.

use std::sync::Arc;

use tracing::debug;

use crate::config::PanelConfig;
use crate::model::{ProcessId, ProcessSummary};
use crate::registry::ProcessRegistry;

pub mod resize;
pub mod store;

pub use resize::{ListenerId, PointerCapture, ResizeGesture};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanelState {
    Collapsed,
    #[default]
    Expanded,
    Maximized,
}

pub struct PanelViewModel {
    registry: Arc<ProcessRegistry>,
    store: Box<dyn KeyValueStore>,
    config: PanelConfig,
    state: PanelState,
    height: u32,
    selected: Option<ProcessId>,
}

impl PanelViewModel {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        store: Box<dyn KeyValueStore>,
        config: PanelConfig,
    ) -> Self {
        let stored = match store.load(&config.height_key) {
            Ok(value) => value,
            Err(error) => {
                debug!(%error, key = %config.height_key, "failed to load panel height");
                None
            }
        };
        let height = config.clamp_height(stored.unwrap_or(i64::from(config.default_height)));
        Self {
            registry,
            store,
            config,
            state: PanelState::default(),
            height,
            selected: None,
        }
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    /// Newest first; equal start times fall back to id order.
    pub fn process_list(&self) -> Vec<ProcessSummary> {
        let mut processes = self.registry.summaries();
        processes.sort_by(|left, right| {
            right
                .started_at
                .cmp(&left.started_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        processes
    }

    pub fn running_count(&self) -> usize {
        self.registry
            .summaries()
            .iter()
            .filter(|summary| summary.status.is_active())
            .count()
    }

    pub fn completed_count(&self) -> usize {
        self.registry
            .summaries()
            .iter()
            .filter(|summary| summary.status.is_terminal())
            .count()
    }

    pub fn state(&self) -> PanelState {
        self.state
    }

    pub fn set_state(&mut self, state: PanelState) {
        self.state = state;
    }

    pub fn toggle_collapsed(&mut self) -> PanelState {
        self.state = match self.state {
            PanelState::Collapsed => PanelState::Expanded,
            PanelState::Expanded | PanelState::Maximized => PanelState::Collapsed,
        };
        self.state
    }

    pub fn height(&self) -> u32 {
        self.config.clamp_height(i64::from(self.height))
    }

    /// Clamps, keeps and persists `height`. A failed save keeps the new
    /// value in memory.
    pub fn set_height(&mut self, height: i64) -> u32 {
        let clamped = self.config.clamp_height(height);
        self.height = clamped;
        if let Err(error) = self
            .store
            .save(&self.config.height_key, i64::from(clamped))
        {
            debug!(%error, key = %self.config.height_key, "failed to persist panel height");
        }
        clamped
    }

    pub fn begin_resize<'a>(
        &'a mut self,
        pointer_y: i32,
        capture: &'a dyn PointerCapture,
    ) -> ResizeGesture<'a> {
        ResizeGesture::begin(self, capture, pointer_y)
    }

    /// Returns false and leaves the selection alone for unknown ids.
    pub fn select_process(&mut self, id: &ProcessId) -> bool {
        if self.registry.status(id).is_none() {
            return false;
        }
        self.selected = Some(id.clone());
        true
    }

    pub fn selected_process_id(&mut self) -> Option<ProcessId> {
        if let Some(id) = &self.selected {
            if self.registry.status(id).is_none() {
                self.selected = None;
            }
        }
        self.selected.clone()
    }

    pub fn selected_process(&mut self) -> Option<ProcessSummary> {
        let id = self.selected_process_id()?;
        self.registry.summary(&id)
    }

    pub fn set_auto_scroll(&self, id: &ProcessId, auto_scroll: bool) -> bool {
        self.registry.set_auto_scroll(id, auto_scroll)
    }
}

#[cfg(test)]
#[path = "../tests/panel_tests.rs"]
mod tests;

use super::PanelViewModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Global pointer move/up listener registration owned by the view layer.
pub trait PointerCapture {
    fn attach(&self) -> ListenerId;
    fn detach(&self, listener: ListenerId);
}

/// An in-progress drag of the panel's top edge. The pointer listeners are
/// detached exactly once, on [`ResizeGesture::release`] or on drop.
pub struct ResizeGesture<'a> {
    panel: &'a mut PanelViewModel,
    capture: &'a dyn PointerCapture,
    listener: Option<ListenerId>,
    start_y: i32,
    start_height: u32,
}

impl<'a> ResizeGesture<'a> {
    pub(super) fn begin(
        panel: &'a mut PanelViewModel,
        capture: &'a dyn PointerCapture,
        pointer_y: i32,
    ) -> Self {
        let start_height = panel.height();
        let listener = capture.attach();
        Self {
            panel,
            capture,
            listener: Some(listener),
            start_y: pointer_y,
            start_height,
        }
    }

    /// Dragging up grows the panel. Returns the applied height.
    pub fn pointer_moved(&mut self, pointer_y: i32) -> u32 {
        let delta = i64::from(self.start_y) - i64::from(pointer_y);
        self.panel.set_height(i64::from(self.start_height) + delta)
    }

    pub fn height(&self) -> u32 {
        self.panel.height()
    }

    pub fn release(mut self) -> u32 {
        self.detach();
        self.panel.height()
    }

    fn detach(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.capture.detach(listener);
        }
    }
}

impl Drop for ResizeGesture<'_> {
    fn drop(&mut self) {
        self.detach();
    }
}

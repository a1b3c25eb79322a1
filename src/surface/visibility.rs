use std::collections::HashMap;

use super::SurfaceId;
use crate::guest::VisibilityState;

/// Derives a surface's visibility from its window's show/hide/minimize/restore
/// transitions and reports only actual changes.
#[derive(Default)]
pub struct VisibilityTracker {
    visible: HashMap<SurfaceId, bool>,
}

impl VisibilityTracker {
    /// Record the window state after a transition. Surfaces start out visible.
    pub fn update(
        &mut self,
        surface: SurfaceId,
        shown: bool,
        minimized: bool,
    ) -> Option<VisibilityState> {
        let now_visible = shown && !minimized;
        let previous = self.visible.insert(surface, now_visible).unwrap_or(true);
        if previous == now_visible {
            return None;
        }
        Some(if now_visible {
            VisibilityState::Visible
        } else {
            VisibilityState::Hidden
        })
    }

    pub fn forget(&mut self, surface: SurfaceId) {
        self.visible.remove(&surface);
    }
}

//! Bulk-selection UI state, independent of the server cache.

use std::collections::BTreeSet;

use crate::protocol::TrackId;

/// Selection mode flag plus the checked track ids. Ids may outlive their rows
/// (e.g. after a filter change) until the set is replaced or cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionStore {
    mode: bool,
    selected: BTreeSet<TrackId>,
}

impl SelectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> bool {
        self.mode
    }

    pub fn selected(&self) -> &BTreeSet<TrackId> {
        &self.selected
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.selected.contains(id)
    }

    pub fn enter_mode(&mut self) {
        self.mode = true;
    }

    /// Leaving selection mode always drops the selection.
    pub fn exit_mode(&mut self) {
        self.clear();
    }

    pub fn toggle(&mut self, id: TrackId) {
        if !self.selected.remove(&id) {
            self.selected.insert(id);
        }
    }

    /// Replaces the set with exactly `ids`.
    pub fn select_all(&mut self, ids: impl IntoIterator<Item = TrackId>) {
        self.selected = ids.into_iter().collect();
    }

    /// Exits mode and empties the set in one step.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// True when every visible id is selected and there is at least one.
    pub fn all_selected(&self, visible: &[TrackId]) -> bool {
        !visible.is_empty() && visible.iter().all(|id| self.selected.contains(id))
    }

    /// Toolbar checkbox: select every visible row, or none if all already are.
    pub fn toggle_all(&mut self, visible: &[TrackId]) {
        if self.all_selected(visible) {
            self.select_all(Vec::new());
        } else {
            self.select_all(visible.to_vec());
        }
    }
}

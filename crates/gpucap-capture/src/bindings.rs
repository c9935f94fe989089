//! Output bindings tracked by id, and the command-list nesting that scopes them.

use gpucap_ipc::{EventId, ResourceId};

/// Output-merger and unordered-access bindings of one context, by view id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingState {
    pub render_targets: Vec<ResourceId>,
    pub depth_stencil: ResourceId,
    pub unordered_access: Vec<ResourceId>,
}

impl BindingState {
    pub fn is_empty(&self) -> bool {
        self.render_targets.is_empty()
            && self.depth_stencil.is_null()
            && self.unordered_access.is_empty()
    }

    /// Every bound view that a draw writes.
    pub fn draw_targets(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.render_targets
            .iter()
            .copied()
            .chain((!self.depth_stencil.is_null()).then_some(self.depth_stencil))
    }
}

#[derive(Debug, Clone)]
struct OpenList {
    last_child: EventId,
    saved: BindingState,
    restore_state: bool,
}

/// Tracks command lists whose children are being walked.
///
/// A submitted list runs with fresh bindings. When its last child has been
/// walked the submitting context's bindings are restored or cleared,
/// depending on the flag it was submitted with.
#[derive(Debug, Clone, Default)]
pub struct CommandListTracker {
    open: Vec<OpenList>,
}

impl CommandListTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lists currently open.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Enters a list whose last child is `last_child`. A list without
    /// children is closed straight away.
    pub fn enter(
        &mut self,
        event_id: EventId,
        last_child: Option<EventId>,
        restore_state: bool,
        bindings: &mut BindingState,
    ) {
        let saved = std::mem::take(bindings);
        self.open.push(OpenList {
            last_child: last_child.unwrap_or(event_id),
            saved,
            restore_state,
        });
        if last_child.is_none() {
            self.leave(event_id, bindings);
        }
    }

    /// Closes every list whose last child is at or before `event_id`.
    /// Returns true when `bindings` changed.
    pub fn leave(&mut self, event_id: EventId, bindings: &mut BindingState) -> bool {
        let mut changed = false;
        while self
            .open
            .last()
            .is_some_and(|list| list.last_child <= event_id)
        {
            if let Some(list) = self.open.pop() {
                *bindings = if list.restore_state {
                    list.saved
                } else {
                    BindingState::default()
                };
                changed = true;
            }
        }
        changed
    }

    pub fn reset(&mut self) {
        self.open.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt(raw: u64) -> BindingState {
        BindingState {
            render_targets: vec![ResourceId::from_raw(raw)],
            ..Default::default()
        }
    }

    #[test]
    fn test_list_restores_bindings() {
        let mut tracker = CommandListTracker::new();
        let mut bindings = rt(5);
        tracker.enter(10, Some(12), true, &mut bindings);
        assert!(bindings.is_empty());
        assert!(!tracker.leave(11, &mut bindings));
        bindings = rt(9);
        assert!(tracker.leave(12, &mut bindings));
        assert_eq!(bindings, rt(5));
        assert_eq!(tracker.depth(), 0);
    }

    #[test]
    fn test_list_clears_without_restore() {
        let mut tracker = CommandListTracker::new();
        let mut bindings = rt(5);
        tracker.enter(3, None, false, &mut bindings);
        assert!(bindings.is_empty());
        assert_eq!(tracker.depth(), 0);
    }

    #[test]
    fn test_nested_lists_close_together() {
        let mut tracker = CommandListTracker::new();
        let mut bindings = rt(1);
        tracker.enter(1, Some(6), true, &mut bindings);
        bindings = rt(2);
        tracker.enter(4, Some(6), true, &mut bindings);
        assert_eq!(tracker.depth(), 2);
        tracker.leave(6, &mut bindings);
        assert_eq!(tracker.depth(), 0);
        assert_eq!(bindings, rt(1));
    }
}

//! Client-side reconciliation of server snapshots into rendered items.
//!
//! A client keeps a rendered item set (normally owned by a timeline widget).
//! When a snapshot arrives, [`reconcile`] issues only the add/update/remove
//! calls needed to make the rendered set match it, so untouched items keep
//! their UI state. Applying the same snapshot twice issues no calls.

use crate::protocol::{ClientMessage, ServerMessage};
use crate::task::{Task, TaskPatch, UNASSIGNED_GROUP};
use std::collections::HashSet;

/// A task normalized for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineItem {
    pub id: String,
    pub content: String,
    pub start: String,
    pub end: String,
    pub group: String,
    pub subgroup: Option<String>,
    pub style: String,
}

impl TimelineItem {
    /// Normalize a task: default group, `activity` as subgroup fallback and a
    /// group-derived style when none is given.
    pub fn from_task(task: &Task) -> Self {
        let group = non_empty(Some(task.group.as_str()))
            .unwrap_or(UNASSIGNED_GROUP)
            .to_owned();
        let style = match non_empty(task.style.as_deref()) {
            Some(style) => style.to_owned(),
            None => group_style(&group),
        };
        Self {
            id: task.id.clone(),
            content: task.content.clone(),
            start: task.start.clone(),
            end: task.end.clone(),
            subgroup: non_empty(task.effective_subgroup()).map(str::to_owned),
            group,
            style,
        }
    }

    /// Back to a wire record, as pushed by full-state sync.
    pub fn to_task(&self) -> Task {
        let mut task = Task::new(
            self.id.clone(),
            self.content.clone(),
            self.start.clone(),
            self.end.clone(),
            self.group.clone(),
        );
        task.subgroup = self.subgroup.clone();
        task.style = Some(self.style.clone());
        task
    }

    /// Compare the displayed fields. Absent and empty are equal.
    pub fn differs_from(&self, other: &Self) -> bool {
        self.content != other.content
            || self.start != other.start
            || self.end != other.end
            || self.group != other.group
            || self.subgroup.as_deref().unwrap_or("") != other.subgroup.as_deref().unwrap_or("")
            || self.style != other.style
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Stable pastel background for a group.
pub fn group_style(group: &str) -> String {
    format!("background-color:hsl({},65%,75%)", group_hue(group))
}

// FNV-1a, so every client picks the same color for the same group.
fn group_hue(group: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in group.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % 360
}

/// The rendered item set a snapshot is reconciled into.
pub trait RenderedItems {
    fn get(&self, id: &str) -> Option<&TimelineItem>;
    /// Ids of all rendered items, in display order.
    fn ids(&self) -> Vec<String>;
    fn add(&mut self, item: TimelineItem);
    fn update(&mut self, item: TimelineItem);
    fn remove(&mut self, id: &str);
    /// Replace the derived group list (filters, lanes).
    fn set_groups(&mut self, groups: &[String]);
}

/// In-memory rendered set, used by the WebSocket client and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalTimeline {
    items: Vec<TimelineItem>,
    groups: Vec<String>,
}

impl LocalTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[TimelineItem] {
        &self.items
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl RenderedItems for LocalTimeline {
    fn get(&self, id: &str) -> Option<&TimelineItem> {
        self.items.iter().find(|item| item.id == id)
    }

    fn ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }

    fn add(&mut self, item: TimelineItem) {
        match self.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    fn update(&mut self, item: TimelineItem) {
        self.add(item);
    }

    fn remove(&mut self, id: &str) {
        self.items.retain(|item| item.id != id);
    }

    fn set_groups(&mut self, groups: &[String]) {
        self.groups = groups.to_vec();
    }
}

/// Calls issued by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Distinct groups after the pass, in first-seen order.
    pub groups: Vec<String>,
}

impl ReconcileReport {
    /// `true` when the pass changed no rendered item.
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

/// Make `view` match `snapshot` with the fewest item calls.
pub fn reconcile<R: RenderedItems + ?Sized>(view: &mut R, snapshot: &[Task]) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let mut incoming: HashSet<&str> = HashSet::with_capacity(snapshot.len());

    for task in snapshot {
        incoming.insert(task.id.as_str());
        let item = TimelineItem::from_task(task);
        match view.get(&item.id).map(|existing| existing.differs_from(&item)) {
            Some(false) => {}
            Some(true) => {
                view.update(item);
                report.updated += 1;
            }
            None => {
                view.add(item);
                report.added += 1;
            }
        }
    }

    for id in view.ids() {
        if !incoming.contains(id.as_str()) {
            view.remove(&id);
            report.removed += 1;
        }
    }

    let mut seen = HashSet::new();
    for id in view.ids() {
        if let Some(item) = view.get(&id)
            && seen.insert(item.group.clone())
        {
            report.groups.push(item.group.clone());
        }
    }
    view.set_groups(&report.groups);
    report
}

/// Client view of the shared collection.
#[derive(Debug, Clone, Default)]
pub struct ClientState<R = LocalTimeline> {
    view: R,
    initialized: bool,
}

impl<R: RenderedItems> ClientState<R> {
    pub fn new(view: R) -> Self {
        Self {
            view,
            initialized: false,
        }
    }

    pub fn view(&self) -> &R {
        &self.view
    }

    /// Whether an `init` snapshot has been applied.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Apply one server message. Snapshot messages of every kind reconcile;
    /// `pong` changes nothing.
    pub fn apply(&mut self, message: ServerMessage) -> Option<ReconcileReport> {
        match message {
            ServerMessage::Init { tasks } => {
                self.initialized = true;
                Some(reconcile(&mut self.view, &tasks))
            }
            ServerMessage::Update { tasks } | ServerMessage::Sync { tasks } => {
                Some(reconcile(&mut self.view, &tasks))
            }
            ServerMessage::Pong => None,
        }
    }

    /// Optimistically render a new task and return the `add` to send.
    pub fn add_local(&mut self, mut task: Task) -> ClientMessage {
        if task.needs_id() {
            let view = &self.view;
            task.id = Task::generate_unique_id(|id| view.get(id).is_some());
        }
        let message = ClientMessage::Add { task };
        self.replay(&message);
        message
    }

    /// Optimistically merge `patch` into the rendered item and return the
    /// `update` to send. A patch for an unknown id that carries the dates
    /// is rendered as a new item.
    pub fn update_local(&mut self, patch: TaskPatch) -> ClientMessage {
        let message = ClientMessage::Update { task: patch };
        self.replay(&message);
        message
    }

    /// Optimistically drop the item and return the `remove` to send.
    pub fn remove_local(&mut self, id: &str) -> ClientMessage {
        let message = ClientMessage::Remove { id: id.to_owned() };
        self.replay(&message);
        message
    }

    /// Render the effect of an outgoing operation on the local view.
    ///
    /// Used for optimistic edits and again after a reconnect, when edits the
    /// server has not seen yet are laid over the fresh `init`.
    pub fn replay(&mut self, message: &ClientMessage) {
        match message {
            ClientMessage::Add { task } => self.view.add(TimelineItem::from_task(task)),
            ClientMessage::Update { task: patch } => match self.view.get(&patch.id) {
                Some(existing) => {
                    let mut task = existing.to_task();
                    patch.apply_to(&mut task);
                    self.view.update(TimelineItem::from_task(&task));
                }
                None => {
                    if let Ok(task) = patch.clone().into_task() {
                        self.view.add(TimelineItem::from_task(&task));
                    }
                }
            },
            ClientMessage::Remove { id } => self.view.remove(id),
            ClientMessage::Replace { tasks } => {
                reconcile(&mut self.view, tasks);
            }
            ClientMessage::Resync | ClientMessage::Ping => {}
        }
    }

    /// Every rendered item as wire records, in display order.
    pub fn tasks(&self) -> Vec<Task> {
        self.view
            .ids()
            .iter()
            .filter_map(|id| self.view.get(id))
            .map(TimelineItem::to_task)
            .collect()
    }

    /// A `replace` carrying the whole local state.
    pub fn full_state(&self) -> ClientMessage {
        ClientMessage::Replace {
            tasks: self.tasks(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    /// Counts every call so tests can assert on churn.
    #[derive(Default)]
    struct CountingView {
        inner: LocalTimeline,
        adds: usize,
        updates: usize,
        removes: usize,
    }

    impl RenderedItems for CountingView {
        fn get(&self, id: &str) -> Option<&TimelineItem> {
            self.inner.get(id)
        }
        fn ids(&self) -> Vec<String> {
            self.inner.ids()
        }
        fn add(&mut self, item: TimelineItem) {
            self.adds += 1;
            self.inner.add(item);
        }
        fn update(&mut self, item: TimelineItem) {
            self.updates += 1;
            self.inner.update(item);
        }
        fn remove(&mut self, id: &str) {
            self.removes += 1;
            self.inner.remove(id);
        }
        fn set_groups(&mut self, groups: &[String]) {
            self.inner.set_groups(groups);
        }
    }

    fn task(id: &str, group: &str) -> Task {
        Task::new(id, format!("task {id}"), "2024-01-01T00:00:00Z", "2024-01-01T01:00:00Z", group)
    }

    #[test]
    fn normalization_fills_defaults() {
        let mut raw = task("t1", "");
        raw.activity = Some("Design".to_owned());
        let item = TimelineItem::from_task(&raw);

        assert_eq!(item.group, UNASSIGNED_GROUP);
        assert_eq!(item.subgroup.as_deref(), Some("Design"));
        assert_eq!(item.style, group_style(UNASSIGNED_GROUP));
        assert!(item.style.starts_with("background-color:hsl("));
        assert!(item.style.ends_with(",65%,75%)"));
    }

    #[test]
    fn explicit_style_and_subgroup_win() {
        let mut raw = task("t1", "P1").with_style("background-color:red");
        raw.subgroup = Some("Fase 1".to_owned());
        raw.activity = Some("ignored".to_owned());
        let item = TimelineItem::from_task(&raw);
        assert_eq!(item.style, "background-color:red");
        assert_eq!(item.subgroup.as_deref(), Some("Fase 1"));
    }

    #[test]
    fn group_colors_are_stable() {
        assert_eq!(group_style("COMMESSA_A"), group_style("COMMESSA_A"));
        assert!(group_hue("anything") < 360);
    }

    #[test]
    fn absent_and_empty_subgroup_compare_equal() {
        let a = TimelineItem::from_task(&task("t1", "P1"));
        let mut b = a.clone();
        b.subgroup = Some(String::new());
        assert!(!a.differs_from(&b));
        b.content = "changed".to_owned();
        assert!(a.differs_from(&b));
    }

    #[test]
    fn reconcile_adds_updates_and_removes_minimally() {
        let mut view = CountingView::default();
        reconcile(&mut view, &[task("a", "P1"), task("b", "P1"), task("c", "P2")]);
        assert_eq!(view.adds, 3);

        let mut changed = task("b", "P1");
        changed.content = "renamed".to_owned();
        let report = reconcile(&mut view, &[task("a", "P1"), changed, task("d", "P3")]);

        assert_eq!(report.added, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(report.groups, vec!["P1", "P3"]);
        assert_eq!(view.inner.ids(), vec!["a", "b", "d"]);
        assert_eq!(view.inner.get("b").unwrap().content, "renamed");
        assert_eq!(view.inner.groups(), ["P1", "P3"]);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let snapshot = vec![task("a", "P1"), task("b", "P2").with_subgroup("S")];
        let mut view = CountingView::default();
        reconcile(&mut view, &snapshot);
        let (adds, updates, removes) = (view.adds, view.updates, view.removes);

        let report = reconcile(&mut view, &snapshot);

        assert!(report.is_noop());
        assert_eq!((view.adds, view.updates, view.removes), (adds, updates, removes));
    }

    #[test]
    fn empty_snapshot_clears_the_view() {
        let mut view = LocalTimeline::new();
        reconcile(&mut view, &[task("a", "P1")]);
        let report = reconcile(&mut view, &[]);
        assert_eq!(report.removed, 1);
        assert!(view.is_empty());
        assert!(view.groups().is_empty());
    }

    #[test]
    fn client_state_dispatches_by_message_kind() {
        let mut state = ClientState::new(LocalTimeline::new());
        assert!(!state.is_initialized());

        let report = state
            .apply(ServerMessage::Init {
                tasks: vec![task("a", "P1")],
            })
            .unwrap();
        assert_eq!(report.added, 1);
        assert!(state.is_initialized());

        assert!(state.apply(ServerMessage::Pong).is_none());

        let report = state
            .apply(ServerMessage::Sync {
                tasks: vec![task("a", "P1"), task("b", "P1")],
            })
            .unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(state.view().len(), 2);
    }

    #[test]
    fn local_adds_never_reuse_a_rendered_id() {
        let mut state = ClientState::new(LocalTimeline::new());
        for _ in 0..200 {
            state.add_local(task("", "P1"));
        }
        assert_eq!(state.view().len(), 200);
    }

    #[test]
    fn replay_lays_pending_edits_over_a_fresh_snapshot() {
        let mut state = ClientState::new(LocalTimeline::new());
        let pending = vec![
            state.add_local(task("mine", "P2")),
            state.remove_local("a"),
        ];

        state.apply(ServerMessage::Init {
            tasks: vec![task("a", "P1"), task("b", "P1")],
        });
        assert!(state.view().get("mine").is_none());

        for message in &pending {
            state.replay(message);
        }
        assert_eq!(state.view().ids(), vec!["b", "mine"]);
    }

    #[test]
    fn local_edits_render_optimistically() {
        let mut state = ClientState::new(LocalTimeline::new());

        let ClientMessage::Add { task: sent } = state.add_local(task("", "P1")) else {
            panic!("expected add");
        };
        assert!(sent.id.starts_with("task-"));
        assert!(state.view().get(&sent.id).is_some());

        let mut patch = TaskPatch::for_id(sent.id.clone());
        patch.content = Some("edited".to_owned());
        state.update_local(patch);
        assert_eq!(state.view().get(&sent.id).unwrap().content, "edited");

        let ClientMessage::Replace { tasks } = state.full_state() else {
            panic!("expected replace");
        };
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].content, "edited");

        state.remove_local(&sent.id);
        assert!(state.view().is_empty());
    }
}

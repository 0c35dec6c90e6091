//! Canonical task store.
//!
//! The single in-process source of truth. It is owned by the router task and
//! mutated only through the operations below, each of which runs to
//! completion without suspending. Snapshots share the backing vector
//! copy-on-write, so handing one to the persistence writer or a connection
//! never observes a later mutation.

use crate::task::{Task, TaskPatch};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Immutable, complete copy of the task collection at a point in time.
pub type Snapshot = Arc<Vec<Task>>;

/// What `add` does when the id is already present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddCollisionPolicy {
    /// Shallow-merge the incoming fields over the stored record.
    #[default]
    Merge,
    /// Replace the stored record in place.
    Overwrite,
}

impl AddCollisionPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "merge" | "update" => Some(Self::Merge),
            "overwrite" | "replace" => Some(Self::Overwrite),
            _ => None,
        }
    }
}

/// Effect of a single-record operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new record was appended.
    Inserted,
    /// An existing record was changed in place.
    Updated,
}

/// Store operation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("update requires a task id")]
    MissingId,
    #[error("task {id} does not exist and the update lacks `{field}` to create it")]
    Incomplete { id: String, field: &'static str },
}

/// Authoritative ordered task collection.
#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    tasks: Snapshot,
    version: u64,
    collision: AddCollisionPolicy,
}

impl TaskStore {
    /// Empty store using the given collision policy.
    pub fn new(collision: AddCollisionPolicy) -> Self {
        Self {
            tasks: Arc::new(Vec::new()),
            version: 0,
            collision,
        }
    }

    /// Store seeded from persisted state. Ids are normalized the same way
    /// `replace_all` does. The version starts at zero, or at one when
    /// normalization changed the records, so the result gets written back.
    pub fn from_tasks(tasks: Vec<Task>, collision: AddCollisionPolicy) -> Self {
        let (tasks, changed) = dedupe(tasks);
        let mut store = Self::new(collision);
        store.tasks = Arc::new(tasks);
        store.version = u64::from(changed);
        store
    }

    /// Monotonic counter bumped by every effective mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Immutable copy of the current collection.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.tasks)
    }

    /// Insert a task, assigning an id if it has none.
    ///
    /// An existing id is handled per [`AddCollisionPolicy`]. Returns the id the
    /// record is stored under.
    pub fn add(&mut self, mut task: Task) -> (String, Applied) {
        if task.needs_id() {
            task.id = self.unique_id();
        }
        let id = task.id.clone();
        let collision = self.collision;
        let tasks = Arc::make_mut(&mut self.tasks);

        let applied = match tasks.iter_mut().find(|t| t.id == id) {
            Some(existing) => {
                match collision {
                    AddCollisionPolicy::Merge => TaskPatch::from(&task).apply_to(existing),
                    AddCollisionPolicy::Overwrite => *existing = task,
                }
                Applied::Updated
            }
            None => {
                tasks.push(task);
                Applied::Inserted
            }
        };
        self.version += 1;
        (id, applied)
    }

    /// Merge `patch` over the record with the same id; an unknown id is
    /// inserted as a new record, as `add` would.
    pub fn update(&mut self, patch: TaskPatch) -> Result<Applied, StoreError> {
        if patch.id.trim().is_empty() {
            return Err(StoreError::MissingId);
        }

        if let Some(existing) = Arc::make_mut(&mut self.tasks)
            .iter_mut()
            .find(|t| t.id == patch.id)
        {
            patch.apply_to(existing);
            self.version += 1;
            return Ok(Applied::Updated);
        }

        let id = patch.id.clone();
        let task = patch
            .into_task()
            .map_err(|field| StoreError::Incomplete { id, field })?;
        Arc::make_mut(&mut self.tasks).push(task);
        self.version += 1;
        Ok(Applied::Inserted)
    }

    /// Delete the record with `id`. Absent ids are a no-op.
    pub fn remove(&mut self, id: &str) -> bool {
        if !self.tasks.iter().any(|t| t.id == id) {
            return false;
        }
        Arc::make_mut(&mut self.tasks).retain(|t| t.id != id);
        self.version += 1;
        true
    }

    /// Discard the collection and install `tasks`.
    ///
    /// Entries without an id get one; repeated ids keep the first position
    /// with the last value. Returns the resulting record count.
    pub fn replace_all(&mut self, tasks: Vec<Task>) -> usize {
        self.tasks = Arc::new(dedupe(tasks).0);
        self.version += 1;
        self.tasks.len()
    }

    fn unique_id(&self) -> String {
        Task::generate_unique_id(|id| self.get(id).is_some())
    }
}

/// Assign missing ids and collapse repeated ones: first position wins, last
/// value wins. Returns `true` if anything had to change.
fn dedupe(tasks: Vec<Task>) -> (Vec<Task>, bool) {
    // Generated ids must miss every explicit id, including ones further on.
    let mut taken: HashSet<String> = tasks
        .iter()
        .filter(|t| !t.needs_id())
        .map(|t| t.id.clone())
        .collect();
    let mut seen: HashSet<String> = HashSet::with_capacity(tasks.len());
    let mut out: Vec<Task> = Vec::with_capacity(tasks.len());
    let mut changed = false;

    for mut task in tasks {
        if task.needs_id() {
            task.id = Task::generate_unique_id(|id| taken.contains(id));
            taken.insert(task.id.clone());
            changed = true;
        }
        if seen.insert(task.id.clone()) {
            out.push(task);
        } else if let Some(slot) = out.iter_mut().find(|t| t.id == task.id) {
            *slot = task;
            changed = true;
        }
    }
    (out, changed)
}

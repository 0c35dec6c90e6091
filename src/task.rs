//! Task records exchanged between clients, the canonical store, and disk.
//!
//! A [`Task`] is a full record as stored and broadcast. A [`TaskPatch`] is the
//! partial form carried by `update` operations: absent fields keep the stored
//! value, an explicit `null` clears a nullable field.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Group assigned to tasks that arrive without a project/commessa.
pub const UNASSIGNED_GROUP: &str = "SENZA_COMMESSA";

/// Prefix for server-assigned task ids.
const ID_PREFIX: &str = "task";

/// A schedulable item with a time range, display text, and project group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id within the collection. Empty when the sender left it out.
    #[serde(default, deserialize_with = "de::id_string")]
    pub id: String,
    /// Display text.
    #[serde(default, deserialize_with = "de::string_or_empty")]
    pub content: String,
    /// ISO-8601 start timestamp.
    pub start: String,
    /// ISO-8601 end timestamp. Not checked against `start`.
    pub end: String,
    /// Project (commessa) identifier.
    #[serde(default = "unassigned_group", deserialize_with = "de::group")]
    pub group: String,
    /// Optional sub-activity.
    #[serde(default)]
    pub subgroup: Option<String>,
    /// Alternate spelling of `subgroup` used by some clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    /// Presentation hint, e.g. `background-color:...`.
    #[serde(default)]
    pub style: Option<String>,
    /// Attributes this crate does not interpret, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn unassigned_group() -> String {
    UNASSIGNED_GROUP.to_owned()
}

impl Task {
    /// Build a task with the required fields and no optional attributes.
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        let group = group.into();
        Self {
            id: id.into(),
            content: content.into(),
            start: start.into(),
            end: end.into(),
            group: if group.is_empty() {
                unassigned_group()
            } else {
                group
            },
            subgroup: None,
            activity: None,
            style: None,
            extra: Map::new(),
        }
    }

    /// Set the sub-activity.
    #[must_use]
    pub fn with_subgroup(mut self, subgroup: impl Into<String>) -> Self {
        self.subgroup = Some(subgroup.into());
        self
    }

    /// Set the style hint.
    #[must_use]
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    /// `true` when the sender did not supply an id.
    pub fn needs_id(&self) -> bool {
        self.id.trim().is_empty()
    }

    /// Generate a fresh id of the form `task-<unix millis>-<0..1000>`.
    pub fn generate_id() -> String {
        let suffix: u32 = rand::thread_rng().gen_range(0..1000);
        format!("{ID_PREFIX}-{}-{suffix}", Utc::now().timestamp_millis())
    }

    /// Generate ids until one is not `taken`.
    pub fn generate_unique_id(taken: impl Fn(&str) -> bool) -> String {
        loop {
            let id = Self::generate_id();
            if !taken(&id) {
                return id;
            }
        }
    }

    /// Sub-classification used for display: `subgroup`, else `activity`.
    pub fn effective_subgroup(&self) -> Option<&str> {
        self.subgroup
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.activity.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Partial task carried by an `update` operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    /// Id of the record to update (required).
    #[serde(deserialize_with = "de::id_string")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(
        default,
        deserialize_with = "de::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub group: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "de::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub subgroup: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "de::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub activity: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "de::double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub style: Option<Option<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskPatch {
    /// Patch touching only the id; fields are filled in by the caller.
    pub fn for_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Shallow-merge the supplied fields over `task`.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(content) = &self.content {
            task.content.clone_from(content);
        }
        if let Some(start) = &self.start {
            task.start.clone_from(start);
        }
        if let Some(end) = &self.end {
            task.end.clone_from(end);
        }
        if let Some(group) = &self.group {
            task.group = group
                .clone()
                .filter(|g| !g.is_empty())
                .unwrap_or_else(unassigned_group);
        }
        if let Some(subgroup) = &self.subgroup {
            task.subgroup.clone_from(subgroup);
        }
        if let Some(activity) = &self.activity {
            task.activity.clone_from(activity);
        }
        if let Some(style) = &self.style {
            task.style.clone_from(style);
        }
        for (key, value) in &self.extra {
            task.extra.insert(key.clone(), value.clone());
        }
    }

    /// Build a full record from this patch, for an update of an unknown id.
    ///
    /// Returns the name of the first required field that is missing.
    pub fn into_task(self) -> Result<Task, &'static str> {
        let start = self.start.ok_or("start")?;
        let end = self.end.ok_or("end")?;
        let mut task = Task::new(
            self.id,
            self.content.unwrap_or_default(),
            start,
            end,
            self.group.flatten().unwrap_or_default(),
        );
        task.subgroup = self.subgroup.flatten();
        task.activity = self.activity.flatten();
        task.style = self.style.flatten();
        task.extra = self.extra;
        Ok(task)
    }
}

impl From<&Task> for TaskPatch {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            content: Some(task.content.clone()),
            start: Some(task.start.clone()),
            end: Some(task.end.clone()),
            group: Some(Some(task.group.clone())),
            subgroup: Some(task.subgroup.clone()),
            activity: task.activity.clone().map(Some),
            style: Some(task.style.clone()),
            extra: task.extra.clone(),
        }
    }
}

/// Field deserializers tolerant of the loosely typed JSON browsers send.
mod de {
    use super::UNASSIGNED_GROUP;
    use serde::{Deserialize, Deserializer, de::Error};
    use serde_json::Value;

    /// Ids may arrive as strings or numbers; both are compared as strings.
    pub fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        match Value::deserialize(d)? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Null => Ok(String::new()),
            other => Err(D::Error::custom(format!(
                "id must be a string or number, got {other}"
            ))),
        }
    }

    pub fn string_or_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
    }

    pub fn group<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(Option::<String>::deserialize(d)?
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| UNASSIGNED_GROUP.to_owned()))
    }

    /// Distinguishes an explicit `null` (`Some(None)`) from an absent field (`None`).
    pub fn double_option<'de, D, T>(d: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(d).map(Some)
    }
}

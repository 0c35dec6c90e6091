//! Wire envelopes for the real-time task protocol (JSON text frames).
//!
//! Client → server: `add`, `update`, `remove`, `replace`, `sync`, `ping`.
//! Server → client: `init`, `update`/`sync` snapshots, `pong`.

use crate::task::{Task, TaskPatch};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// An inbound operation after shape validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Append a task (id assigned server-side when missing).
    Add { task: Task },
    /// Shallow-merge a partial task into the stored one.
    Update { task: TaskPatch },
    /// Delete by id.
    Remove { id: String },
    /// Install a complete collection.
    Replace { tasks: Vec<Task> },
    /// Ask for the current snapshot, answered to the sender only.
    #[serde(rename = "sync")]
    Resync,
    /// Liveness probe, answered with `pong`.
    Ping,
}

impl ClientMessage {
    /// Parse and validate a text frame.
    ///
    /// Returns `Ok(None)` for a well-formed envelope with an unrecognized
    /// `type`, which callers ignore.
    pub fn parse(text: &str) -> Result<Option<Self>, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(mut body) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let kind = match body.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        };

        let message = match kind.as_str() {
            "add" => Self::Add {
                task: decode(&mut body, "task")?,
            },
            // Browsers push their whole post-edit state as `update` + `tasks`.
            "update" if body.contains_key("tasks") => Self::Replace {
                tasks: decode(&mut body, "tasks")?,
            },
            "update" => {
                let task: TaskPatch = decode(&mut body, "task")?;
                if task.id.trim().is_empty() {
                    return Err(ProtocolError::MissingField("task.id"));
                }
                Self::Update { task }
            }
            "remove" => Self::Remove {
                id: decode_id(&mut body)?,
            },
            "replace" => Self::Replace {
                tasks: decode(&mut body, "tasks")?,
            },
            "sync" if body.contains_key("tasks") => Self::Replace {
                tasks: decode(&mut body, "tasks")?,
            },
            "sync" => Self::Resync,
            "ping" => Self::Ping,
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    /// Operation name for diagnostics.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Update { .. } => "update",
            Self::Remove { .. } => "remove",
            Self::Replace { .. } => "replace",
            Self::Resync => "sync",
            Self::Ping => "ping",
        }
    }

    /// `true` for operations that change the canonical store.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Add { .. } | Self::Update { .. } | Self::Remove { .. } | Self::Replace { .. }
        )
    }

    /// Serialize for sending over the wire.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    body: &mut Map<String, Value>,
    field: &'static str,
) -> Result<T, ProtocolError> {
    match body.remove(field) {
        None | Some(Value::Null) => Err(ProtocolError::MissingField(field)),
        Some(value) => serde_json::from_value(value).map_err(|e| ProtocolError::InvalidField {
            field,
            reason: e.to_string(),
        }),
    }
}

fn decode_id(body: &mut Map<String, Value>) -> Result<String, ProtocolError> {
    let id = match body.remove("id") {
        Some(Value::String(id)) => id,
        Some(Value::Number(n)) => n.to_string(),
        None | Some(Value::Null) => return Err(ProtocolError::MissingField("id")),
        Some(other) => {
            return Err(ProtocolError::InvalidField {
                field: "id",
                reason: format!("expected string or number, got {other}"),
            });
        }
    };
    if id.trim().is_empty() {
        return Err(ProtocolError::MissingField("id"));
    }
    Ok(id)
}

/// Outbound message as received by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full state, sent once right after connecting.
    Init {
        #[serde(default)]
        tasks: Vec<Task>,
    },
    /// Full state after another client's mutation.
    Update {
        #[serde(default)]
        tasks: Vec<Task>,
    },
    /// Full state, same meaning as `update`.
    Sync {
        #[serde(default)]
        tasks: Vec<Task>,
    },
    /// Reply to `ping`.
    Pong,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }
}

/// Tag used on snapshot frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Init,
    #[default]
    Update,
    Sync,
}

impl SnapshotKind {
    /// Parse a fan-out tag. `init` is reserved for connection setup.
    pub fn parse_broadcast(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "update" => Some(Self::Update),
            "sync" => Some(Self::Sync),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct SnapshotFrame<'a> {
    #[serde(rename = "type")]
    kind: SnapshotKind,
    tasks: &'a [Task],
}

/// Serialized outbound frame, shared between connections.
pub type Frame = Arc<str>;

/// Encode a snapshot frame without cloning the tasks.
pub fn encode_snapshot(kind: SnapshotKind, tasks: &[Task]) -> Result<Frame, ProtocolError> {
    serde_json::to_string(&SnapshotFrame { kind, tasks })
        .map(Frame::from)
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Encode the `pong` reply.
pub fn encode_pong() -> Frame {
    Frame::from(r#"{"type":"pong"}"#)
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no string `type`")]
    MissingType,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("cannot encode message: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::task::UNASSIGNED_GROUP;

    fn parse(text: &str) -> ClientMessage {
        ClientMessage::parse(text).unwrap().unwrap()
    }

    #[test]
    fn parses_add() {
        let msg = parse(
            r#"{"type":"add","task":{"id":"t1","content":"X","start":"2024-01-01T00:00:00Z","end":"2024-01-01T01:00:00Z","group":"P1"}}"#,
        );
        let ClientMessage::Add { task } = msg else {
            panic!("expected add, got {msg:?}");
        };
        assert_eq!(task.id, "t1");
        assert_eq!(task.group, "P1");
    }

    #[test]
    fn add_without_id_is_accepted() {
        let msg = parse(r#"{"type":"add","task":{"start":"a","end":"b"}}"#);
        let ClientMessage::Add { task } = msg else {
            panic!("expected add");
        };
        assert!(task.needs_id());
        assert_eq!(task.group, UNASSIGNED_GROUP);
    }

    #[test]
    fn update_with_task_array_is_a_replace() {
        let msg = parse(r#"{"type":"update","tasks":[{"id":"a","start":"s","end":"e"}]}"#);
        assert!(matches!(msg, ClientMessage::Replace { ref tasks } if tasks.len() == 1));
    }

    #[test]
    fn update_requires_an_id() {
        let err = ClientMessage::parse(r#"{"type":"update","task":{"content":"x"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField { field: "task", .. }));

        let err = ClientMessage::parse(r#"{"type":"update","task":{"id":""}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("task.id"));
    }

    #[test]
    fn remove_accepts_numeric_ids() {
        assert_eq!(
            parse(r#"{"type":"remove","id":7}"#),
            ClientMessage::Remove { id: "7".to_owned() }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"remove"}"#).unwrap_err(),
            ProtocolError::MissingField("id")
        );
    }

    #[test]
    fn sync_without_payload_is_a_resync_request() {
        assert_eq!(parse(r#"{"type":"sync"}"#), ClientMessage::Resync);
        assert!(matches!(
            parse(r#"{"type":"sync","tasks":[]}"#),
            ClientMessage::Replace { .. }
        ));
    }

    #[test]
    fn unknown_type_is_ignored() {
        assert_eq!(ClientMessage::parse(r#"{"type":"shout"}"#).unwrap(), None);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            ClientMessage::parse("{not json").unwrap_err(),
            ProtocolError::InvalidJson(_)
        ));
        assert_eq!(
            ClientMessage::parse("[1,2]").unwrap_err(),
            ProtocolError::NotAnObject
        );
        assert_eq!(
            ClientMessage::parse(r#"{"task":{}}"#).unwrap_err(),
            ProtocolError::MissingType
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"add"}"#).unwrap_err(),
            ProtocolError::MissingField("task")
        );
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"replace","tasks":{"id":"a"}}"#).unwrap_err(),
            ProtocolError::InvalidField { field: "tasks", .. }
        ));
    }

    #[test]
    fn snapshot_frames_decode_as_server_messages() {
        let tasks = vec![Task::new("t1", "X", "a", "b", "P1")];
        let frame = encode_snapshot(SnapshotKind::Update, &tasks).unwrap();
        assert_eq!(
            ServerMessage::parse(&frame).unwrap(),
            ServerMessage::Update {
                tasks: tasks.clone()
            }
        );
        let frame = encode_snapshot(SnapshotKind::Init, &[]).unwrap();
        assert_eq!(&*frame, r#"{"type":"init","tasks":[]}"#);
        assert_eq!(ServerMessage::parse(&encode_pong()).unwrap(), ServerMessage::Pong);
    }

    #[test]
    fn client_messages_serialize_with_wire_tags() {
        let json = ClientMessage::Resync.to_json().unwrap();
        assert_eq!(json, r#"{"type":"sync"}"#);
        let json = ClientMessage::Remove { id: "t1".into() }.to_json().unwrap();
        assert_eq!(json, r#"{"type":"remove","id":"t1"}"#);
        let json = ClientMessage::Ping.to_json().unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }
}

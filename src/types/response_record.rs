use serde::{Deserialize, Serialize};

/// Action type that marks the end of a streamed reply.
pub const DONE_TYPE: &str = "done";

/// One record of a streamed chat reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseRecord {
    /// An increment of text belonging to the action named by `action`.
    Content {
        /// The action type tag.
        action: String,
        /// The text increment.
        content: String,
    },

    /// Explicit end-of-stream marker.
    Done,
}

#[derive(Serialize, Deserialize)]
struct WireRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

impl ResponseRecord {
    /// Creates a content record.
    pub fn content(action: impl Into<String>, content: impl Into<String>) -> Self {
        ResponseRecord::Content {
            action: action.into(),
            content: content.into(),
        }
    }

    /// Parses one JSON record.
    ///
    /// Returns `None` for anything that is not a well-formed record: invalid JSON, a missing
    /// `type`, or a non-`done` record without string `content`.
    pub fn from_json(json: &str) -> Option<Self> {
        let wire: WireRecord = serde_json::from_str(json).ok()?;
        if wire.kind == DONE_TYPE {
            return Some(ResponseRecord::Done);
        }
        wire.content.map(|content| ResponseRecord::Content {
            action: wire.kind,
            content,
        })
    }

    /// Serializes the record in its wire form.
    pub fn to_json(&self) -> String {
        let wire = match self {
            ResponseRecord::Content { action, content } => WireRecord {
                kind: action.clone(),
                content: Some(content.clone()),
            },
            ResponseRecord::Done => WireRecord {
                kind: DONE_TYPE.to_string(),
                content: None,
            },
        };
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

//! Live-data wire messages.
//!
//! Messages are JSON objects tagged by their `msg` field. Transport framing is
//! someone else's concern; this module only parses and renders text frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diff::ChangedFields;
use crate::error::{Error, Result};
use crate::value::{Document, DocumentId};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: &str = "1";

/// Messages sent by clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "camelCase")]
pub enum ClientMessage {
    Connect {
        version: String,
        #[serde(default)]
        support: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Sub {
        id: String,
        name: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    Unsub {
        id: String,
    },
    Method {
        id: String,
        method: String,
        #[serde(default)]
        params: Vec<Value>,
        #[serde(
            rename = "randomSeed",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        random_seed: Option<String>,
    },
}

impl ClientMessage {
    /// Parses a text frame.
    ///
    /// Anything that is not a well-formed client message is rejected with
    /// `Error::MalformedInput`.
    pub fn parse(frame: &str) -> Result<Self> {
        serde_json::from_str(frame)
            .map_err(|e| Error::malformed(format!("unparseable client message: {}", e)))
    }

    /// Renders the message as a text frame.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error payload carried by `nosub` and `result`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: Value,
    pub reason: String,
    #[serde(rename = "errorType")]
    pub error_type: String,
}

impl ErrorPayload {
    /// Creates a payload with an explicit code.
    pub fn new(error: impl Into<Value>, reason: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: reason.into(),
            error_type: "Meteor.Error".to_string(),
        }
    }

    /// Converts an internal error into what the client may see.
    ///
    /// Application errors and lookup failures are passed through; everything
    /// else is reported as an opaque internal error.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Client { error, reason } => Self::new(error.clone(), reason.clone()),
            Error::MethodNotFound { name } => {
                Self::new(404, format!("Method '{}' not found", name))
            }
            Error::PublicationNotFound { name } => {
                Self::new(404, format!("Subscription '{}' not found", name))
            }
            Error::MalformedInput { message }
            | Error::InvalidSelector { message }
            | Error::InvalidModifier { message }
            | Error::InvalidSort { message }
            | Error::InvalidProjection { message } => Self::new(400, message.clone()),
            _ => Self::new(500, "Internal server error"),
        }
    }
}

/// Messages sent by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "camelCase")]
pub enum ServerMessage {
    Connected {
        session: String,
    },
    Failed {
        version: String,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Error {
        reason: String,
        #[serde(
            rename = "offendingMessage",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        offending_message: Option<String>,
    },
    Nosub {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    Added {
        collection: String,
        id: DocumentId,
        #[serde(default, skip_serializing_if = "Document::is_empty")]
        fields: Document,
    },
    AddedBefore {
        collection: String,
        id: DocumentId,
        #[serde(default, skip_serializing_if = "Document::is_empty")]
        fields: Document,
        before: Option<DocumentId>,
    },
    Changed {
        collection: String,
        id: DocumentId,
        #[serde(default, skip_serializing_if = "Document::is_empty")]
        fields: Document,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cleared: Vec<String>,
    },
    MovedBefore {
        collection: String,
        id: DocumentId,
        before: Option<DocumentId>,
    },
    Removed {
        collection: String,
        id: DocumentId,
    },
    Ready {
        subs: Vec<String>,
    },
    Result {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    Updated {
        methods: Vec<String>,
    },
}

impl ServerMessage {
    /// Builds a `changed` message from a field-level patch, splitting
    /// cleared fields into the `cleared` list.
    pub fn changed(collection: impl Into<String>, id: DocumentId, changes: &ChangedFields) -> Self {
        let mut fields = Document::new();
        let mut cleared = Vec::new();
        for (key, value) in changes {
            match value {
                Some(value) => {
                    fields.insert(key.clone(), value.clone());
                }
                None => cleared.push(key.clone()),
            }
        }
        ServerMessage::Changed {
            collection: collection.into(),
            id,
            fields,
            cleared,
        }
    }

    /// Returns the patch carried by a `changed` message.
    pub fn changed_fields(&self) -> Option<ChangedFields> {
        match self {
            ServerMessage::Changed {
                fields, cleared, ..
            } => {
                let mut changes: ChangedFields = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Some(v.clone())))
                    .collect();
                for key in cleared {
                    changes.insert(key.clone(), None);
                }
                Some(changes)
            }
            _ => None,
        }
    }

    /// Returns the collection a data message refers to.
    pub fn collection(&self) -> Option<&str> {
        match self {
            ServerMessage::Added { collection, .. }
            | ServerMessage::AddedBefore { collection, .. }
            | ServerMessage::Changed { collection, .. }
            | ServerMessage::MovedBefore { collection, .. }
            | ServerMessage::Removed { collection, .. } => Some(collection),
            _ => None,
        }
    }

    /// Parses a text frame.
    pub fn parse(frame: &str) -> Result<Self> {
        serde_json::from_str(frame)
            .map_err(|e| Error::malformed(format!("unparseable server message: {}", e)))
    }

    /// Renders the message as a text frame.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

//! Wire-stable error model.
//!
//! Errors destined for API callers are written into the payload as an
//! `error.<parent>` subtree. The integer codes are part of the wire contract;
//! new kinds are appended, existing ones are never renumbered.

use serde::{Serialize, Serializer};
use serde_json::json;

use crate::payload::Payload;

/// Error classification exposed to callers as `error.<parent>.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An error within the engine logic or operation itself.
    Internal,
    /// An error related to an incoming or in-process API call.
    Request,
    /// A call or command wasn't completed before the allocated timeout.
    Timeout,
    /// The last command wasn't completed before the zombie give-up time.
    Zombie,
}

impl ErrorKind {
    pub fn code(self) -> i64 {
        match self {
            ErrorKind::Internal => 0,
            ErrorKind::Request => 1,
            ErrorKind::Timeout => 2,
            ErrorKind::Zombie => 3,
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

/// An error to be communicated back to the API caller. The parent name
/// differentiates this error from others when a response carries several.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub parent: String,
    pub details: String,
    pub input: String,
    pub kind: ErrorKind,
}

impl ApiError {
    pub fn new(
        parent: impl Into<String>,
        details: impl Into<String>,
        input: impl Into<String>,
        kind: ErrorKind,
    ) -> Self {
        Self {
            parent: parent.into(),
            details: details.into(),
            input: input.into(),
            kind,
        }
    }

    /// Writes this error into a payload under `error.<parent>`.
    pub fn apply_to(&self, payload: &mut Payload) {
        payload.set(
            &format!("error.{}", self.parent),
            json!({
                "details": self.details,
                "type": self.kind.code(),
                "input": self.input,
            }),
        );
    }

    /// A bare response document carrying only this error subtree.
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::from_value(json!({}));
        self.apply_to(&mut payload);
        payload
    }
}

//! Shared types for the Bolt gateway engine: the configuration model, the
//! dynamic worker payload document, and the wire-stable error model.

pub mod config;
pub mod error;
pub mod payload;

pub use config::{
    ApiCall, CacheSection, CommandInfo, CommandMeta, Config, ConfigError, HandlerAccess,
    SecurityGroup,
};
pub use error::{ApiError, ErrorKind};
pub use payload::Payload;

use serde::{Serialize, Serializer};

/// Worker-asserted short-circuit: placed in `nextCommand` to end the call
/// with the current state treated as final success.
pub const HALT_CALL: &str = "HALT_CALL";

/// Durable queue (after the configured prefix) workers publish errors to.
pub const ERROR_QUEUE_NAME: &str = "BOLT_WORKER_ERROR";

/// Request header that bypasses the result cache for a single call.
pub const NO_CACHE_HEADER: &str = "Bolt-No-Cache";

/// How an API call was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// Fire and forget: no id, no way to retrieve the result.
    Work,
    /// Fire and check: id returned immediately, result fetched later.
    Task,
    /// Fire and wait: the response carries the result or a timeout + id.
    Request,
}

impl CallType {
    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Work => "work",
            CallType::Task => "task",
            CallType::Request => "request",
        }
    }
}

// Wire form is the integer constant, matching the persisted status output.
impl Serialize for CallType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let code: u8 = match self {
            CallType::Work => 0,
            CallType::Task => 1,
            CallType::Request => 2,
        };
        serializer.serialize_u8(code)
    }
}

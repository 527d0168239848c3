//! Qlik Engine API wire types.
//!
//! This crate defines the JSON-RPC envelope exchanged with the engine over a
//! WebSocket, the definitions used to create transient session objects, and
//! tolerant views over the computed layouts the engine returns.
//!
//! # Envelope
//!
//! Requests carry `jsonrpc: "2.0"`, a strictly increasing integer id, the
//! handle of the server-side object they address (`-1` for the global scope),
//! a method name, and positional or named params. Replies carry either a
//! `result` or an `error`; anything else on the wire is a notification and is
//! skipped by the session layer.
//!
//! ```ignore
//! use qsense_protocol::{Handle, RpcRequest};
//!
//! let req = RpcRequest::new(1, "OpenDoc", Handle::NONE, serde_json::json!(["my-app"]));
//! let wire = serde_json::to_string(&req)?;
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod layout;
pub mod objects;

pub use layout::{Cell, CrossTabData, DataPage, FieldValue, FieldValues, GenericLayout};
pub use objects::{CatalogKind, CrossTabDef, SessionObjectDef, ValueListDef};

/// JSON-RPC version tag sent on every request.
pub const JSONRPC_VERSION: &str = "2.0";

// =============================================================================
// Handles
// =============================================================================

/// Integer reference to a live server-side object within one connection's
/// lifetime. `-1` is the "no handle / global scope" sentinel and never names
/// a real object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub i64);

impl Handle {
    /// Global scope / no object.
    pub const NONE: Handle = Handle(-1);

    /// True for handles that name an actual engine object.
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Handle {
    fn from(raw: i64) -> Self {
        Handle(raw)
    }
}

// =============================================================================
// Request envelope
// =============================================================================

/// One JSON-RPC request. Field order matches what the engine expects on the
/// wire; `params` is either a positional array or a named object depending on
/// the method.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub handle: i64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, handle: Handle, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            handle: handle.0,
            method: method.into(),
            params,
        }
    }
}

// =============================================================================
// Incoming messages
// =============================================================================

/// Any message read off the socket: a reply (has `result` or `error`) or a
/// notification (has neither). The engine interleaves notifications freely,
/// so every field is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    /// Engine error payload, passed through verbatim. No assumption is made
    /// about its shape beyond "it is JSON".
    #[serde(default)]
    pub error: Option<Value>,
}

impl RpcMessage {
    /// True when this message is a reply to some request rather than an
    /// asynchronous notification.
    pub fn is_reply(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }
}

// =============================================================================
// Common reply fragments
// =============================================================================

/// The `qReturn` fragment carried by replies that hand out an object handle
/// (`OpenDoc`, `CreateSessionObject`, `GetObject`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectReturn {
    #[serde(rename = "qHandle", default = "default_handle")]
    pub handle: Handle,
    #[serde(rename = "qGenericId", default)]
    pub generic_id: Option<String>,
    #[serde(rename = "qType", default)]
    pub object_type: Option<String>,
}

fn default_handle() -> Handle {
    Handle::NONE
}

/// A created session object: its handle plus the id the engine filed it
/// under (needed to destroy it).
#[derive(Debug, Clone)]
pub struct ObjectRef {
    pub handle: Handle,
    pub id: String,
}

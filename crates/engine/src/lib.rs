//! Engine API session client.
//!
//! Connects to a Qlik Sense engine over WebSocket, speaks its JSON-RPC
//! protocol, and manages the lifecycle of the server-side objects it asks
//! the engine to materialize.
//!
//! The client is strictly synchronous: one request in flight per session,
//! with the call that sent it blocking until the matching reply arrives.
//! Callers that want concurrent queries open independent sessions (one per
//! document); a session and its document handle belong to a single logical
//! owner.
//!
//! ```ignore
//! use qsense_config::EngineConfig;
//! use qsense_engine::EngineSession;
//!
//! let config = EngineConfig::from_env()?;
//! let mut session = EngineSession::new(config);
//! session.open_document("aaec8d41-5201-43ab-809f-3063750dfafd")?;
//! let values = session.field_values("Country", 100, true)?;
//! session.close_document()?;
//! ```

use std::fmt;
use std::time::Duration;

use serde_json::Value;

mod ops;
mod session;
mod tls;
mod transport;

pub use ops::{FieldInfo, FieldStatistics, StatValue};
pub use session::{ConnectionState, EngineSession};
pub use transport::{candidates, EndpointCandidate, EndpointTarget};

// Re-export the protocol types callers handle directly.
pub use qsense_protocol::{
    CatalogKind, CrossTabData, CrossTabDef, FieldValues, GenericLayout, Handle, ObjectRef,
    SessionObjectDef, ValueListDef,
};

/// Cap on each candidate's TCP connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default socket read timeout. Layout computation can legitimately take a
/// while; a stalled engine should still not block the caller forever.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from the engine client.
#[derive(Debug)]
pub enum EngineError {
    /// Every candidate endpoint failed. Each attempt is recorded as
    /// (url, failure); the last entry is the proximate cause.
    Connection { attempts: Vec<(String, String)> },
    /// TLS material could not be assembled from the configured policy.
    Tls(String),
    /// A call was issued without a live socket.
    NotConnected,
    /// A document-scoped operation was issued with no document open.
    NoDocumentOpen,
    /// Transport failure during send or receive.
    Io(String),
    /// The engine did not reply within the read timeout.
    Timeout(String),
    /// A frame arrived that does not fit the protocol, or a reply was
    /// missing a section this client requires.
    Protocol(String),
    /// The engine returned an error reply; the payload is passed through
    /// verbatim.
    Remote(Value),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Connection { attempts } => {
                write!(f, "Failed to connect to Engine API")?;
                for (url, failure) in attempts {
                    write!(f, "\n  {}: {}", url, failure)?;
                }
                if let Some((_, last)) = attempts.last() {
                    write!(f, "\nLast error: {}", last)?;
                }
                Ok(())
            }
            EngineError::Tls(msg) => write!(f, "TLS configuration error: {}", msg),
            EngineError::NotConnected => write!(f, "Not connected to Engine API"),
            EngineError::NoDocumentOpen => write!(f, "No document is open on this session"),
            EngineError::Io(msg) => write!(f, "I/O error: {}", msg),
            EngineError::Timeout(msg) => write!(f, "Engine did not reply in time: {}", msg),
            EngineError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            EngineError::Remote(payload) => write!(f, "Engine API error: {}", payload),
        }
    }
}

impl std::error::Error for EngineError {}

/// Outcome of a composite read that created, consumed, and destroyed a
/// session object. A destroy failure after a successful read never fails the
/// read; it is carried here instead.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    /// Set when the best-effort destroy of the backing session object
    /// failed.
    pub cleanup_warning: Option<String>,
}

impl<T> Fetched<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            cleanup_warning: None,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

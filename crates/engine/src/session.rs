//! The RPC session: one socket, one request in flight, one document.

use std::net::TcpStream;
use std::time::Duration;

use serde_json::{json, Value};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use qsense_config::EngineConfig;
use qsense_protocol::{Handle, RpcMessage, RpcRequest};

use crate::transport::{self, EndpointTarget};
use crate::{EngineError, DEFAULT_READ_TIMEOUT};

/// Where the session currently stands with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A synchronous session against one engine.
///
/// The session is bound to at most one scope at a time — the global endpoint
/// or one document. Switching scope tears the socket down and reconnects;
/// the protocol does not rebind a live socket. Handles are only meaningful
/// on the connection that produced them, so a reconnect invalidates the
/// document handle.
pub struct EngineSession {
    config: EngineConfig,
    socket: Option<WebSocket<MaybeTlsStream<TcpStream>>>,
    state: ConnectionState,
    request_id: u64,
    read_timeout: Duration,
    document_id: Option<String>,
    document_handle: Handle,
}

impl EngineSession {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            socket: None,
            state: ConnectionState::Disconnected,
            request_id: 0,
            read_timeout: DEFAULT_READ_TIMEOUT,
            document_id: None,
            document_handle: Handle::NONE,
        }
    }

    /// Override the socket read timeout (default 60 s).
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Id of the document this session is bound to, if any.
    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    /// Handle of the open document; [`Handle::NONE`] when no document is
    /// open.
    pub fn document_handle(&self) -> Handle {
        self.document_handle
    }

    /// Connect to the global engine endpoint (document list, opening
    /// documents). A session already bound to a document is torn down first;
    /// an existing global connection is reused.
    pub fn connect_global(&mut self) -> Result<(), EngineError> {
        if self.is_connected() {
            if self.document_id.is_none() {
                return Ok(());
            }
            self.disconnect();
        }
        self.establish(EndpointTarget::Global)
    }

    /// Drop the socket and forget everything scoped to it. Any handle
    /// obtained on this session is dead afterwards.
    pub fn disconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None);
            let _ = socket.flush();
        }
        self.state = ConnectionState::Disconnected;
        self.document_id = None;
        self.document_handle = Handle::NONE;
    }

    fn establish(&mut self, target: EndpointTarget<'_>) -> Result<(), EngineError> {
        self.state = ConnectionState::Connecting;
        match transport::connect(&self.config, target, self.read_timeout) {
            Ok(socket) => {
                self.socket = Some(socket);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    /// Send one request and block for its reply.
    ///
    /// Replies are matched on the request id. Notifications and replies to
    /// other ids (which a conforming engine will not send under the
    /// one-in-flight discipline, but an unsolicited message could imitate)
    /// are skipped, not misattributed.
    pub fn call(
        &mut self,
        method: &str,
        params: Value,
        handle: Handle,
    ) -> Result<Value, EngineError> {
        let socket = self.socket.as_mut().ok_or(EngineError::NotConnected)?;

        self.request_id += 1;
        let id = self.request_id;
        let request = RpcRequest::new(id, method, handle, params);
        let wire = serde_json::to_string(&request)
            .map_err(|e| EngineError::Protocol(e.to_string()))?;

        socket.send(Message::Text(wire)).map_err(map_socket_error)?;

        loop {
            let frame = socket.read().map_err(map_socket_error)?;
            let text = match frame {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        log::debug!("skipping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => {
                    return Err(EngineError::Io("connection closed by engine".to_string()))
                }
                _ => continue,
            };

            let message: RpcMessage = match serde_json::from_str(&text) {
                Ok(message) => message,
                Err(_) => {
                    log::debug!("skipping unparseable frame");
                    continue;
                }
            };

            if !message.is_reply() {
                log::debug!("skipping notification {:?}", message.method);
                continue;
            }
            if message.id != Some(id) {
                log::debug!(
                    "skipping reply for id {:?} while waiting for {}",
                    message.id,
                    id
                );
                continue;
            }

            if let Some(error) = message.error {
                return Err(EngineError::Remote(error));
            }
            return Ok(message.result.unwrap_or(Value::Null));
        }
    }

    /// Open a document in no-data mode (the right default for metadata
    /// work). See [`EngineSession::open_document_with`].
    pub fn open_document(&mut self, app_id: &str) -> Result<Handle, EngineError> {
        self.open_document_with(app_id, true)
    }

    /// Open a document, reconnecting as needed.
    ///
    /// A session bound to a different document (or to the global endpoint)
    /// is torn down first. If the engine reports the document as already
    /// open by this identity, recovery adopts the existing handle: first via
    /// `GetActiveDoc`, then by scanning `GetDocList`; if neither yields one,
    /// the original error propagates.
    pub fn open_document_with(
        &mut self,
        app_id: &str,
        no_data: bool,
    ) -> Result<Handle, EngineError> {
        if self.is_connected()
            && self.document_id.as_deref() == Some(app_id)
            && self.document_handle.is_valid()
        {
            return Ok(self.document_handle);
        }

        if self.socket.is_some() {
            self.disconnect();
        }
        self.establish(EndpointTarget::Document(app_id))?;

        let params = if no_data {
            json!([app_id, "", "", "", true])
        } else {
            json!([app_id])
        };

        let reply = match self.call("OpenDoc", params, Handle::NONE) {
            Ok(reply) => reply,
            Err(EngineError::Remote(payload)) if is_already_open(&payload) => {
                self.recover_open_conflict(app_id, payload)?
            }
            Err(err) => {
                self.disconnect();
                return Err(err);
            }
        };

        let handle = reply
            .get("qReturn")
            .and_then(|r| r.get("qHandle"))
            .and_then(Value::as_i64)
            .map(Handle)
            .filter(|h| h.is_valid());

        match handle {
            Some(handle) => {
                self.document_id = Some(app_id.to_string());
                self.document_handle = handle;
                Ok(handle)
            }
            None => {
                self.disconnect();
                Err(EngineError::Protocol(
                    "OpenDoc reply carried no document handle".to_string(),
                ))
            }
        }
    }

    /// Close the open document and drop the connection. Returns the engine's
    /// success flag; with no document open this only disconnects.
    pub fn close_document(&mut self) -> Result<bool, EngineError> {
        if !self.document_handle.is_valid() {
            self.disconnect();
            return Ok(false);
        }
        let handle = self.document_handle;
        let result = self.call("CloseDoc", json!([]), handle);
        self.disconnect();

        let reply = result?;
        Ok(reply
            .get("qReturn")
            .and_then(|r| r.get("qSuccess"))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Documents the engine advertises.
    pub fn doc_list(&mut self) -> Result<Vec<Value>, EngineError> {
        let result = self.call("GetDocList", json!([]), Handle::NONE)?;
        Ok(result
            .get("qDocList")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub(crate) fn document_handle_checked(&self) -> Result<Handle, EngineError> {
        if self.document_handle.is_valid() {
            Ok(self.document_handle)
        } else {
            Err(EngineError::NoDocumentOpen)
        }
    }

    /// The conflict path: the engine rejects a second concurrent open of the
    /// same document from the same identity, so adopt the handle it already
    /// holds.
    fn recover_open_conflict(
        &mut self,
        app_id: &str,
        original: Value,
    ) -> Result<Value, EngineError> {
        if let Ok(active) = self.call("GetActiveDoc", json!([]), Handle::NONE) {
            let has_handle = active
                .get("qReturn")
                .and_then(|r| r.get("qHandle"))
                .and_then(Value::as_i64)
                .map_or(false, |h| h >= 0);
            if has_handle {
                return Ok(active);
            }
        }

        if let Ok(docs) = self.doc_list() {
            for doc in docs {
                let matches = doc.get("qDocId").and_then(Value::as_str) == Some(app_id)
                    || doc.get("qDocName").and_then(Value::as_str) == Some(app_id);
                if !matches {
                    continue;
                }
                if let Some(handle) = doc.get("qHandle").and_then(Value::as_i64) {
                    if handle >= 0 {
                        return Ok(json!({
                            "qReturn": { "qHandle": handle, "qGenericId": app_id }
                        }));
                    }
                }
            }
        }

        Err(EngineError::Remote(original))
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn is_already_open(payload: &Value) -> bool {
    payload.to_string().to_lowercase().contains("already open")
}

fn map_socket_error(err: tungstenite::Error) -> EngineError {
    use std::io::ErrorKind;
    match err {
        tungstenite::Error::Io(io)
            if io.kind() == ErrorKind::WouldBlock || io.kind() == ErrorKind::TimedOut =>
        {
            EngineError::Timeout(io.to_string())
        }
        tungstenite::Error::Io(io) => EngineError::Io(io.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            EngineError::Io("connection closed".to_string())
        }
        other => EngineError::Protocol(other.to_string()),
    }
}

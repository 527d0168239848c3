//! Endpoint negotiation.
//!
//! The engine exposes its WebSocket under a handful of URL variants; which
//! one answers depends on deployment (proxy vs direct, TLS offload). The
//! connector tries a fixed, ordered candidate list and takes the first
//! endpoint that completes the handshake and sends its greeting. There is no
//! retry loop beyond the list and no backoff.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Connector, Message, WebSocket};
use url::Url;

use qsense_config::EngineConfig;

use crate::{EngineError, CONNECT_TIMEOUT};

/// Identity header asserted at connection time; the engine performs no
/// further authentication handshake.
pub const IDENTITY_HEADER: &str = "X-Qlik-User";

/// What the socket should be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointTarget<'a> {
    /// Engine-wide operations: document list, opening documents by id.
    Global,
    /// One document's endpoint; required before `OpenDoc` for that document.
    Document(&'a str),
}

/// One endpoint to try, in list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCandidate {
    pub url: String,
    pub secured: bool,
}

/// Ordered candidate list for a target. Secured variants come before their
/// unsecured fallbacks; the global target additionally probes the dedicated
/// metadata path before the generic one.
pub fn candidates(config: &EngineConfig, target: EndpointTarget<'_>) -> Vec<EndpointCandidate> {
    let host = config.server_host();
    let port = config.engine_port;

    let candidate = |secured: bool, path: &str| EndpointCandidate {
        url: format!(
            "{}://{}:{}{}",
            if secured { "wss" } else { "ws" },
            host,
            port,
            path
        ),
        secured,
    };

    match target {
        EndpointTarget::Document(app_id) => {
            let path = format!("/app/{}", app_id);
            vec![candidate(true, &path), candidate(false, &path)]
        }
        EndpointTarget::Global => vec![
            candidate(true, "/app/engineData"),
            candidate(true, "/app"),
            candidate(false, "/app/engineData"),
            candidate(false, "/app"),
        ],
    }
}

/// Connect to the first candidate that answers, or fail with every attempt
/// on record.
pub(crate) fn connect(
    config: &EngineConfig,
    target: EndpointTarget<'_>,
    read_timeout: Duration,
) -> Result<WebSocket<MaybeTlsStream<TcpStream>>, EngineError> {
    let candidates = candidates(config, target);
    let tls = if candidates.iter().any(|c| c.secured) {
        Some(crate::tls::client_config(&config.tls)?)
    } else {
        None
    };
    let identity = config.identity_header();

    let mut attempts = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        let connector = if candidate.secured {
            tls.clone().map(Connector::Rustls)
        } else {
            None
        };
        match try_candidate(&candidate.url, connector, &identity, read_timeout) {
            Ok(socket) => return Ok(socket),
            Err(failure) => attempts.push((candidate.url.clone(), failure)),
        }
    }

    Err(EngineError::Connection { attempts })
}

fn try_candidate(
    url: &str,
    connector: Option<Connector>,
    identity: &str,
    read_timeout: Duration,
) -> Result<WebSocket<MaybeTlsStream<TcpStream>>, String> {
    let parsed = Url::parse(url).map_err(|e| format!("invalid url: {}", e))?;
    let host = parsed.host_str().ok_or("url has no host")?;
    let port = parsed
        .port()
        .unwrap_or(if parsed.scheme() == "wss" { 443 } else { 80 });

    let stream = connect_tcp(host, port)?;
    stream
        .set_read_timeout(Some(read_timeout))
        .map_err(|e| e.to_string())?;
    stream
        .set_write_timeout(Some(read_timeout))
        .map_err(|e| e.to_string())?;

    let mut request = url
        .into_client_request()
        .map_err(|e| format!("invalid request: {}", e))?;
    request.headers_mut().insert(
        IDENTITY_HEADER,
        HeaderValue::from_str(identity).map_err(|e| format!("invalid identity header: {}", e))?,
    );

    let (mut socket, _response) =
        tungstenite::client_tls_with_config(request, stream, None, connector)
            .map_err(|e| format!("handshake failed: {}", e))?;

    // The engine announces itself with a notification right after the
    // handshake; the connection does not count as usable until it arrives.
    read_greeting(&mut socket)?;

    Ok(socket)
}

fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, String> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("resolve failed: {}", e))?;

    let mut last = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(format!("{}: {}", addr, e)),
        }
    }
    Err(last.unwrap_or_else(|| format!("{}:{} did not resolve", host, port)))
}

fn read_greeting(socket: &mut WebSocket<MaybeTlsStream<TcpStream>>) -> Result<(), String> {
    loop {
        match socket.read() {
            Ok(Message::Text(_)) | Ok(Message::Binary(_)) => return Ok(()),
            Ok(Message::Close(_)) => return Err("closed before greeting".to_string()),
            Ok(_) => continue,
            Err(e) => return Err(format!("greeting read failed: {}", e)),
        }
    }
}

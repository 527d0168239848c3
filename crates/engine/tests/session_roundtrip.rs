//! End-to-end tests against an in-process scripted engine.
//!
//! The fake engine accepts WebSocket connections on a loopback listener,
//! sends the greeting notification, and answers JSON-RPC requests from a
//! small stateful handler. Secured candidates hit the plain-TCP listener and
//! fail their handshake, exercising the real wss-then-ws fallback path.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::{accept_hdr, Message};

use qsense_config::EngineConfig;
use qsense_engine::{CatalogKind, EngineError, EngineSession};
use qsense_protocol::{Handle, SessionObjectDef, ValueListDef};

// ── Fake engine ─────────────────────────────────────────────────────

#[derive(Default)]
struct EngineState {
    next_handle: i64,
    doc_handle: Option<i64>,
    doc_id: Option<String>,
    /// Live session objects: handle -> (generic id, properties).
    objects: HashMap<i64, (String, Value)>,
    object_handles_by_id: HashMap<String, i64>,
    /// Reject this many OpenDoc calls with "App already open" first.
    open_rejections: usize,
    /// Advertised by GetDocList.
    doc_list: Vec<Value>,
    /// Fail every DestroySessionObject.
    fail_destroy: bool,
    /// Emit a notification and a decoy reply before every real reply.
    noisy: bool,
    /// Never answer these methods (the connection stays open).
    stall_methods: Vec<String>,
    /// Request ids seen, in arrival order.
    seen_ids: Vec<u64>,
    /// HTTP paths of completed WebSocket handshakes.
    seen_paths: Vec<String>,
    /// Reject handshakes for paths other than this one, when set.
    only_path: Option<String>,
}

struct FakeEngine {
    port: u16,
    state: Arc<Mutex<EngineState>>,
}

impl FakeEngine {
    fn spawn(state: EngineState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake engine");
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(state));

        let shared = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let shared = Arc::clone(&shared);
                thread::spawn(move || serve(stream, shared));
            }
        });

        Self { port, state }
    }

    fn config(&self) -> EngineConfig {
        let port = self.port.to_string();
        EngineConfig::from_lookup(move |name| match name {
            "QLIK_SERVER_URL" => Some("http://127.0.0.1".to_string()),
            "QLIK_USER_DIRECTORY" => Some("INTERNAL".to_string()),
            "QLIK_USER_ID" => Some("sa_engine".to_string()),
            "QLIK_ENGINE_PORT" => Some(port.clone()),
            _ => None,
        })
        .expect("test config")
    }

    fn session(&self) -> EngineSession {
        EngineSession::new(self.config()).with_read_timeout(Duration::from_secs(5))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }
}

fn serve(stream: std::net::TcpStream, state: Arc<Mutex<EngineState>>) {
    let callback = {
        let state = Arc::clone(&state);
        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let mut state = state.lock().unwrap();
            let path = req.uri().path().to_string();
            if let Some(only) = &state.only_path {
                if &path != only {
                    state.seen_paths.push(path);
                    let reject = Response::builder().status(404).body(None).unwrap();
                    return Err(reject);
                }
            }
            state.seen_paths.push(path);
            Ok(resp)
        }
    };

    // TLS probes against this plain listener die here; that is expected.
    let Ok(mut socket) = accept_hdr(stream, callback) else {
        return;
    };

    let greeting = json!({
        "jsonrpc": "2.0",
        "method": "OnConnected",
        "params": { "qSessionState": "SESSION_CREATED" },
    });
    if socket.send(Message::Text(greeting.to_string())).is_err() {
        return;
    }

    loop {
        let text = match socket.read() {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return,
            Ok(_) => continue,
        };
        let request: Value = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(_) => continue,
        };

        let id = request["id"].as_u64().unwrap_or(0);
        let method = request["method"].as_str().unwrap_or("").to_string();
        let handle = request["handle"].as_i64().unwrap_or(-1);

        let (reply, noisy) = {
            let mut state = state.lock().unwrap();
            state.seen_ids.push(id);
            if state.stall_methods.contains(&method) {
                continue;
            }
            (
                handle_call(&method, &request["params"], handle, &mut state),
                state.noisy,
            )
        };

        if noisy {
            let notification = json!({
                "jsonrpc": "2.0",
                "method": "OnAuthenticationInformation",
                "params": { "mustAuthenticate": false },
            });
            let decoy = json!({ "jsonrpc": "2.0", "id": 999_999, "result": { "decoy": true } });
            if socket.send(Message::Text(notification.to_string())).is_err()
                || socket.send(Message::Text(decoy.to_string())).is_err()
            {
                return;
            }
        }

        let frame = match reply {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        };
        if socket.send(Message::Text(frame.to_string())).is_err() {
            return;
        }
    }
}

fn handle_call(
    method: &str,
    params: &Value,
    handle: i64,
    state: &mut EngineState,
) -> Result<Value, Value> {
    match method {
        "OpenDoc" => {
            let app_id = params[0].as_str().unwrap_or("").to_string();
            if state.open_rejections > 0 {
                state.open_rejections -= 1;
                return Err(json!({ "code": 1002, "message": "App already open" }));
            }
            state.next_handle += 1;
            state.doc_handle = Some(state.next_handle);
            state.doc_id = Some(app_id.clone());
            Ok(json!({ "qReturn": { "qHandle": state.next_handle, "qGenericId": app_id } }))
        }
        "CloseDoc" => {
            if state.doc_handle != Some(handle) {
                return Err(invalid_handle(handle));
            }
            state.doc_handle = None;
            state.doc_id = None;
            Ok(json!({ "qReturn": { "qSuccess": true } }))
        }
        "GetActiveDoc" => Err(json!({ "code": 1007, "message": "No active document" })),
        "GetDocList" => Ok(json!({ "qDocList": state.doc_list })),
        "CreateSessionObject" => {
            if state.doc_handle != Some(handle) {
                return Err(invalid_handle(handle));
            }
            let props = params[0].clone();
            let object_id = props["qInfo"]["qId"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("obj-{}", state.next_handle + 1));
            if state.object_handles_by_id.contains_key(&object_id) {
                return Err(json!({ "code": 1004, "message": "Object already exists" }));
            }
            state.next_handle += 1;
            state.objects.insert(state.next_handle, (object_id.clone(), props));
            state.object_handles_by_id.insert(object_id.clone(), state.next_handle);
            Ok(json!({
                "qReturn": { "qHandle": state.next_handle, "qGenericId": object_id }
            }))
        }
        "DestroySessionObject" => {
            if state.fail_destroy {
                return Err(json!({ "code": 1005, "message": "Destroy is broken today" }));
            }
            let object_id = params[0].as_str().unwrap_or("");
            let removed = state.object_handles_by_id.remove(object_id);
            if let Some(object_handle) = removed {
                state.objects.remove(&object_handle);
            }
            Ok(json!({ "qReturn": { "qSuccess": removed.is_some() } }))
        }
        "GetLayout" => {
            let Some((_, props)) = state.objects.get(&handle) else {
                return Err(invalid_handle(handle));
            };
            Ok(json!({ "qLayout": layout_for(props) }))
        }
        "Evaluate" => Ok(json!({ "qReturn": { "qText": "42", "qIsNumeric": true } })),
        _ => Err(json!({ "code": 1001, "message": format!("Unknown method {}", method) })),
    }
}

fn invalid_handle(handle: i64) -> Value {
    json!({ "code": 1003, "message": format!("Invalid handle {}", handle) })
}

fn layout_for(props: &Value) -> Value {
    if props.get("qListObjectDef").is_some() {
        json!({
            "qInfo": props["qInfo"],
            "qListObject": {
                "qSize": { "qcx": 1, "qcy": 3 },
                "qDataPages": [{
                    "qMatrix": [
                        [{ "qText": "DE", "qState": "O", "qNum": "NaN", "qFrequency": "7" }],
                        [{ "qText": "SE", "qState": "S", "qNum": "NaN", "qFrequency": "4" }],
                        [{ "qText": "FI", "qState": "X", "qNum": "NaN", "qFrequency": "1" }],
                    ],
                }],
            },
        })
    } else if props.get("qHyperCubeDef").is_some() {
        json!({
            "qInfo": props["qInfo"],
            "qHyperCube": {
                "qSize": { "qcx": 2, "qcy": 2 },
                "qDataPages": [{
                    "qMatrix": [
                        [{ "qText": "DE" }, { "qText": "10", "qNum": 10.0, "qIsNumeric": true }],
                        [{ "qText": "SE" }, { "qText": "20", "qNum": 20.0, "qIsNumeric": true }],
                    ],
                }],
            },
        })
    } else if props.get("qMeasureListDef").is_some() {
        json!({
            "qInfo": props["qInfo"],
            "qMeasureList": { "qItems": [
                { "qInfo": { "qId": "m-1", "qType": "measure" }, "qMeta": { "title": "Revenue" } },
            ]},
        })
    } else {
        json!({ "qInfo": props["qInfo"] })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn global_connect_walks_candidates_and_takes_the_last() {
    // Only the generic /app path answers; /app/engineData is rejected at the
    // HTTP upgrade, and both wss probes die against the plain listener.
    let engine = FakeEngine::spawn(EngineState {
        only_path: Some("/app".to_string()),
        ..EngineState::default()
    });

    let mut session = engine.session();
    session.connect_global().expect("global connect");
    assert!(session.is_connected());
    assert!(session.document_id().is_none());

    let paths = engine.state().seen_paths.clone();
    assert_eq!(paths, ["/app/engineData", "/app"]);
}

#[test]
fn all_candidates_failing_reports_every_attempt() {
    // Grab a port with no listener behind it.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = EngineConfig::from_lookup(move |name| match name {
        "QLIK_SERVER_URL" => Some("http://127.0.0.1".to_string()),
        "QLIK_USER_DIRECTORY" => Some("INTERNAL".to_string()),
        "QLIK_USER_ID" => Some("sa_engine".to_string()),
        "QLIK_ENGINE_PORT" => Some(port.to_string()),
        _ => None,
    })
    .unwrap();

    let mut session = EngineSession::new(config);
    let err = session.connect_global().unwrap_err();
    match &err {
        EngineError::Connection { attempts } => {
            assert_eq!(attempts.len(), 4);
            assert!(attempts[0].0.starts_with("wss://"));
            assert!(attempts[3].0.ends_with("/app"));
        }
        other => panic!("expected Connection, got {:?}", other),
    }
    // The display form names the last candidate's failure.
    assert!(err.to_string().contains("Last error:"));
}

#[test]
fn open_document_and_session_object_lifecycle() {
    let engine = FakeEngine::spawn(EngineState::default());
    let mut session = engine.session();

    let doc = session.open_document("sales-app").expect("open");
    assert!(doc.is_valid());
    assert_eq!(session.document_id(), Some("sales-app"));

    let fetched = session.field_values("Country", 100, true).expect("field values");
    assert!(fetched.cleanup_warning.is_none());
    let values = fetched.value;
    assert_eq!(values.returned, 3);
    assert_eq!(values.total_values, 3);
    assert_eq!(values.values[1].text, "SE");
    assert_eq!(values.values[1].state, "S");
    assert_eq!(values.values[0].frequency.as_deref(), Some("7"));

    // The object was destroyed, so an identical definition creates cleanly.
    let again = session.field_values("Country", 100, true).expect("recreate");
    assert_eq!(again.value.returned, 3);
    assert!(engine.state().objects.is_empty());

    assert!(session.close_document().expect("close"));
    assert!(!session.is_connected());
    assert!(!session.document_handle().is_valid());
}

#[test]
fn reopening_same_document_reuses_the_session() {
    let engine = FakeEngine::spawn(EngineState::default());
    let mut session = engine.session();

    let first = session.open_document("sales-app").unwrap();
    let second = session.open_document("sales-app").unwrap();
    assert_eq!(first, second);

    // One handshake on the ws fallback, not two.
    let handshakes = engine
        .state()
        .seen_paths
        .iter()
        .filter(|p| p.as_str() == "/app/sales-app")
        .count();
    assert_eq!(handshakes, 1);
}

#[test]
fn switching_documents_invalidates_the_stale_handle() {
    let engine = FakeEngine::spawn(EngineState::default());
    let mut session = engine.session();

    let handle_a = session.open_document("app-a").unwrap();
    session.open_document("app-b").unwrap();
    assert_eq!(session.document_id(), Some("app-b"));
    assert_eq!(engine.state().doc_id.as_deref(), Some("app-b"));

    // A's handle belongs to a torn-down connection; using it against the
    // B-bound session must fail, never silently answer for the wrong doc.
    let err = session.get_layout(handle_a).unwrap_err();
    assert!(matches!(err, EngineError::Remote(_)));
}

#[test]
fn already_open_conflict_recovers_via_doc_list() {
    let engine = FakeEngine::spawn(EngineState {
        open_rejections: 1,
        doc_list: vec![json!({ "qDocId": "busy-app", "qHandle": 7 })],
        ..EngineState::default()
    });

    let mut session = engine.session();
    let handle = session.open_document("busy-app").expect("recovered open");
    assert_eq!(handle, Handle(7));
    assert_eq!(session.document_id(), Some("busy-app"));
}

#[test]
fn already_open_without_recovery_propagates_original_error() {
    let engine = FakeEngine::spawn(EngineState {
        open_rejections: 1,
        doc_list: vec![json!({ "qDocId": "some-other-app", "qHandle": 9 })],
        ..EngineState::default()
    });

    let mut session = engine.session();
    let err = session.open_document("busy-app").unwrap_err();
    match err {
        EngineError::Remote(payload) => {
            assert_eq!(payload["message"], "App already open");
        }
        other => panic!("expected the original Remote error, got {:?}", other),
    }
}

#[test]
fn notifications_and_foreign_replies_are_skipped() {
    let engine = FakeEngine::spawn(EngineState {
        noisy: true,
        ..EngineState::default()
    });

    let mut session = engine.session();
    session.open_document("noisy-app").unwrap();
    let result = session.evaluate("Sum(Sales)").expect("evaluate");
    assert_eq!(result["qText"], "42");
}

#[test]
fn request_ids_start_at_one_and_increase() {
    let engine = FakeEngine::spawn(EngineState::default());
    let mut session = engine.session();

    session.open_document("sales-app").unwrap();
    session.evaluate("1+1").unwrap();
    session.evaluate("2+2").unwrap();

    assert_eq!(engine.state().seen_ids, [1, 2, 3]);
}

#[test]
fn destroy_failure_surfaces_as_cleanup_warning() {
    let engine = FakeEngine::spawn(EngineState {
        fail_destroy: true,
        ..EngineState::default()
    });

    let mut session = engine.session();
    session.open_document("sales-app").unwrap();

    let fetched = session.field_values("Country", 10, false).expect("read succeeds");
    assert_eq!(fetched.value.returned, 3);
    let warning = fetched.cleanup_warning.expect("cleanup warning recorded");
    assert!(warning.contains("Destroy is broken today"));
}

#[test]
fn catalog_reads_measure_list() {
    let engine = FakeEngine::spawn(EngineState::default());
    let mut session = engine.session();
    session.open_document("sales-app").unwrap();

    let fetched = session.catalog(CatalogKind::Measures).expect("catalog");
    assert_eq!(fetched.value.len(), 1);
    assert_eq!(fetched.value[0]["qMeta"]["title"], "Revenue");
    assert!(engine.state().objects.is_empty());
}

#[test]
fn stalled_engine_surfaces_a_timeout() {
    let engine = FakeEngine::spawn(EngineState {
        stall_methods: vec!["Evaluate".to_string()],
        ..EngineState::default()
    });

    let mut session = EngineSession::new(engine.config())
        .with_read_timeout(Duration::from_millis(300));
    session.open_document("sales-app").unwrap();

    let err = session.evaluate("Sum(Sales)").unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)), "got {:?}", err);
}

#[test]
fn remote_errors_pass_the_payload_through() {
    let engine = FakeEngine::spawn(EngineState::default());
    let mut session = engine.session();
    session.open_document("sales-app").unwrap();

    let handle = session.document_handle();
    let err = session.call("NoSuchMethod", json!([]), handle).unwrap_err();
    match err {
        EngineError::Remote(payload) => {
            assert_eq!(payload["code"], 1001);
            assert!(payload["message"].as_str().unwrap().contains("NoSuchMethod"));
        }
        other => panic!("expected Remote, got {:?}", other),
    }
}

#[test]
fn calls_without_a_connection_fail_fast() {
    let engine = FakeEngine::spawn(EngineState::default());
    let mut session = engine.session();

    let err = session.call("GetDocList", json!([]), Handle::NONE).unwrap_err();
    assert!(matches!(err, EngineError::NotConnected));

    // Document-scoped operations also gate on the open document.
    session.connect_global().unwrap();
    let err = session.evaluate("1").unwrap_err();
    assert!(matches!(err, EngineError::NoDocumentOpen));
}

#[test]
fn manual_session_object_lifecycle() {
    let engine = FakeEngine::spawn(EngineState::default());
    let mut session = engine.session();
    session.open_document("sales-app").unwrap();

    let def = SessionObjectDef::ValueList(ValueListDef::new("Region").max_values(5));
    let object = session.create_session_object(&def).expect("create");
    assert!(object.handle.is_valid());
    assert_eq!(object.id, "field-values-Region");

    // Layout reads are repeatable against the same handle.
    let first = session.get_layout(object.handle).expect("layout");
    let second = session.get_layout(object.handle).expect("layout again");
    assert_eq!(
        first.list_object.unwrap().data_pages.len(),
        second.list_object.unwrap().data_pages.len()
    );

    assert!(session.destroy_session_object(&object.id).expect("destroy"));
    // Destroying again reports false, not an error.
    assert!(!session.destroy_session_object(&object.id).expect("second destroy"));
}

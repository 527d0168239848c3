//! QRS HTTP client.
//!
//! Blocking reqwest client (no async runtime required). Endpoints are thin:
//! the interesting part is the TLS/identity setup shared with the engine
//! client and the error classification.

use std::fs;
use std::time::Duration;

use serde_json::Value;

use qsense_config::EngineConfig;

// ── Constants ───────────────────────────────────────────────────────

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("qsense/", env!("CARGO_PKG_VERSION"));

/// Repository API client (blocking).
#[derive(Clone)]
pub struct RepositoryClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

/// Error type for repository operations.
#[derive(Debug)]
pub enum RepositoryError {
    /// TLS material could not be loaded from the configured paths.
    Tls(String),
    /// Network error
    Network(String),
    /// HTTP error with status code
    Http(u16, String),
    /// JSON parsing error
    Parse(String),
    /// Server returned a validation error (4xx with message)
    Validation(String),
}

impl std::fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepositoryError::Tls(msg) => write!(f, "TLS configuration error: {}", msg),
            RepositoryError::Network(msg) => write!(f, "Network error: {}", msg),
            RepositoryError::Http(code, msg) => write!(f, "HTTP {}: {}", code, msg),
            RepositoryError::Parse(msg) => write!(f, "Parse error: {}", msg),
            RepositoryError::Validation(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RepositoryError {}

/// Which task collection to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Reload,
    External,
}

impl TaskKind {
    fn endpoint(self) -> &'static str {
        match self {
            TaskKind::Reload => "reloadtask/full",
            TaskKind::External => "externalprogramtask/full",
        }
    }

    fn label(self) -> &'static str {
        match self {
            TaskKind::Reload => "reload",
            TaskKind::External => "external",
        }
    }
}

impl RepositoryClient {
    /// Build a client from the shared connection configuration. TLS material
    /// is loaded here; failures surface before any request goes out.
    pub fn new(config: &EngineConfig) -> Result<Self, RepositoryError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-Qlik-User",
            config
                .identity_header()
                .parse()
                .map_err(|_| RepositoryError::Tls("identity header is not valid ASCII".into()))?,
        );
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let mut builder = reqwest::blocking::Client::builder()
            .use_rustls_tls()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers);

        if !config.tls.verify {
            log::warn!("TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca_path) = &config.tls.ca_cert_path {
            let pem = fs::read(ca_path)
                .map_err(|e| RepositoryError::Tls(format!("{}: {}", ca_path.display(), e)))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| RepositoryError::Tls(format!("{}: {}", ca_path.display(), e)))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(identity) = &config.tls.client_identity {
            let mut pem = fs::read(&identity.cert_path).map_err(|e| {
                RepositoryError::Tls(format!("{}: {}", identity.cert_path.display(), e))
            })?;
            let key = fs::read(&identity.key_path).map_err(|e| {
                RepositoryError::Tls(format!("{}: {}", identity.key_path.display(), e))
            })?;
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| RepositoryError::Tls(e.to_string()))?;
            builder = builder.identity(identity);
        }

        let http = builder
            .build()
            .map_err(|e| RepositoryError::Tls(e.to_string()))?;

        let server = if config.server_url.contains("://") {
            config.server_url.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", config.server_url.trim_end_matches('/'))
        };

        Ok(Self {
            http,
            base_url: format!("{}:{}", server, config.repository_port),
        })
    }

    // ── Apps ────────────────────────────────────────────────────────

    /// List apps, optionally filtered with a QRS filter expression.
    pub fn apps(&self, filter: Option<&str>) -> Result<Vec<Value>, RepositoryError> {
        let value = self.get("app/full", filter)?;
        Ok(unwrap_list(value, &["apps", "data"]))
    }

    pub fn app(&self, app_id: &str) -> Result<Value, RepositoryError> {
        self.get(&format!("app/{}", app_id), None)
    }

    /// Detailed app metadata, including data model information.
    pub fn app_metadata(&self, app_id: &str) -> Result<Value, RepositoryError> {
        self.get(&format!("app/{}/data/metadata", app_id), None)
    }

    /// App objects (sheets, charts, ...), optionally restricted by type.
    pub fn app_objects(
        &self,
        app_id: &str,
        object_type: Option<&str>,
    ) -> Result<Vec<Value>, RepositoryError> {
        let filter = match object_type {
            Some(kind) => format!("app.id eq {} and objectType eq '{}'", app_id, kind),
            None => format!("app.id eq {}", app_id),
        };
        let value = self.get("app/object/full", Some(&filter))?;
        Ok(unwrap_list(value, &[]))
    }

    // ── Directory ───────────────────────────────────────────────────

    pub fn users(&self, filter: Option<&str>) -> Result<Vec<Value>, RepositoryError> {
        let value = self.get("user/full", filter)?;
        Ok(unwrap_list(value, &[]))
    }

    pub fn streams(&self) -> Result<Vec<Value>, RepositoryError> {
        let value = self.get("stream/full", None)?;
        Ok(unwrap_list(value, &[]))
    }

    pub fn data_connections(&self, filter: Option<&str>) -> Result<Vec<Value>, RepositoryError> {
        let value = self.get("dataconnection/full", filter)?;
        Ok(unwrap_list(value, &[]))
    }

    pub fn extensions(&self) -> Result<Vec<Value>, RepositoryError> {
        let value = self.get("extension/full", None)?;
        Ok(unwrap_list(value, &[]))
    }

    pub fn content_libraries(&self) -> Result<Vec<Value>, RepositoryError> {
        let value = self.get("contentlibrary/full", None)?;
        Ok(unwrap_list(value, &[]))
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// List tasks. With no kind given, both collections are fetched and
    /// merged; every row is tagged with its `task_type`.
    pub fn tasks(&self, kind: Option<TaskKind>) -> Result<Vec<Value>, RepositoryError> {
        let kinds: &[TaskKind] = match kind {
            Some(TaskKind::Reload) => &[TaskKind::Reload],
            Some(TaskKind::External) => &[TaskKind::External],
            None => &[TaskKind::Reload, TaskKind::External],
        };

        let mut tasks = Vec::new();
        for kind in kinds {
            let value = self.get(kind.endpoint(), None)?;
            for mut task in unwrap_list(value, &[]) {
                if let Some(fields) = task.as_object_mut() {
                    fields.insert("task_type".to_string(), Value::String(kind.label().into()));
                }
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Reload tasks bound to one app.
    pub fn app_reload_tasks(&self, app_id: &str) -> Result<Vec<Value>, RepositoryError> {
        let filter = format!("app.id eq {}", app_id);
        let value = self.get("reloadtask/full", Some(&filter))?;
        Ok(unwrap_list(value, &[]))
    }

    /// Execution history for one task, most recent first.
    pub fn task_executions(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<Value>, RepositoryError> {
        let filter = format!("executionId eq {}", task_id);
        let url = format!("{}/qrs/executionresult/full", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("filter", filter.as_str()),
                ("orderby", "startTime desc"),
                ("limit", &limit.to_string()),
            ])
            .send()
            .map_err(|e| RepositoryError::Network(e.to_string()))?;
        let value = Self::read_json(response)?;
        Ok(unwrap_list(value, &[]))
    }

    /// Start a task execution.
    pub fn start_task(&self, task_id: &str) -> Result<Value, RepositoryError> {
        let url = format!("{}/qrs/task/{}/start", self.base_url, task_id);
        let response = self
            .http
            .post(&url)
            .send()
            .map_err(|e| RepositoryError::Network(e.to_string()))?;
        Self::read_json(response)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn get(&self, endpoint: &str, filter: Option<&str>) -> Result<Value, RepositoryError> {
        let url = format!("{}/qrs/{}", self.base_url, endpoint);
        let mut request = self.http.get(&url);
        if let Some(filter) = filter {
            request = request.query(&[("filter", filter)]);
        }
        let response = request
            .send()
            .map_err(|e| RepositoryError::Network(e.to_string()))?;
        Self::read_json(response)
    }

    fn read_json(response: reqwest::blocking::Response) -> Result<Value, RepositoryError> {
        let status = response.status().as_u16();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.starts_with("application/json"));
        let body = response
            .text()
            .map_err(|e| RepositoryError::Network(e.to_string()))?;

        if !(200..300).contains(&status) {
            if status == 400 || status == 422 {
                return Err(RepositoryError::Validation(body));
            }
            return Err(RepositoryError::Http(status, body));
        }

        if is_json {
            serde_json::from_str(&body).map_err(|e| RepositoryError::Parse(e.to_string()))
        } else {
            Ok(serde_json::json!({ "raw_response": body }))
        }
    }
}

/// List endpoints usually answer with a bare array, but some deployments
/// wrap it. Anything else degrades to an empty list rather than an error,
/// matching how callers treat partial repository data.
fn unwrap_list(value: Value, wrapper_keys: &[&str]) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut fields) => {
            for key in wrapper_keys {
                if let Some(Value::Array(items)) = fields.remove(*key) {
                    return items;
                }
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

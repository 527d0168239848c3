// Connection configuration
// Loaded from QLIK_* environment variables

use std::env;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default Engine API (WebSocket) port.
pub const DEFAULT_ENGINE_PORT: u16 = 4747;

/// Default Repository API (REST) port.
pub const DEFAULT_REPOSITORY_PORT: u16 = 4242;

/// Connection parameters for one Qlik Sense deployment.
///
/// Construction validates everything needed before any network activity:
/// missing server URL, user directory, or user id is fatal here, not at
/// connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server URL as configured (`https://sense.example.com`); the scheme is
    /// stripped when building WebSocket URLs.
    pub server_url: String,
    pub engine_port: u16,
    pub repository_port: u16,
    /// Identity asserted via the `X-Qlik-User` header.
    pub user_directory: String,
    pub user_id: String,
    pub tls: TlsPolicy,
}

/// TLS material and verification policy shared by the WebSocket and REST
/// clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsPolicy {
    /// When false, both chain and hostname validation are disabled.
    pub verify: bool,
    /// Client certificate and key, always configured as a pair.
    pub client_identity: Option<ClientIdentity>,
    /// Extra CA bundle trusted in addition to the default roots.
    pub ca_cert_path: Option<PathBuf>,
}

/// A client certificate/key pair. The pairing is enforced at construction;
/// there is no way to hold one half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl EngineConfig {
    /// Read configuration from `QLIK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read configuration through an arbitrary lookup. Tests use this to
    /// avoid mutating process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| -> Result<String, ConfigError> {
            match lookup(name) {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(ConfigError::Missing(name)),
            }
        };

        let server_url = required("QLIK_SERVER_URL")?;
        let user_directory = required("QLIK_USER_DIRECTORY")?;
        let user_id = required("QLIK_USER_ID")?;

        let engine_port = parse_port(lookup("QLIK_ENGINE_PORT"), "QLIK_ENGINE_PORT", DEFAULT_ENGINE_PORT)?;
        let repository_port = parse_port(
            lookup("QLIK_REPOSITORY_PORT"),
            "QLIK_REPOSITORY_PORT",
            DEFAULT_REPOSITORY_PORT,
        )?;

        let verify = match lookup("QLIK_VERIFY_SSL") {
            Some(raw) => raw.trim().eq_ignore_ascii_case("true"),
            None => true,
        };

        let client_identity = match (
            lookup("QLIK_CLIENT_CERT_PATH"),
            lookup("QLIK_CLIENT_KEY_PATH"),
        ) {
            (Some(cert), Some(key)) => Some(ClientIdentity {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::UnpairedIdentity("QLIK_CLIENT_KEY_PATH")),
            (None, Some(_)) => return Err(ConfigError::UnpairedIdentity("QLIK_CLIENT_CERT_PATH")),
        };

        Ok(Self {
            server_url,
            engine_port,
            repository_port,
            user_directory,
            user_id,
            tls: TlsPolicy {
                verify,
                client_identity,
                ca_cert_path: lookup("QLIK_CA_CERT_PATH").map(PathBuf::from),
            },
        })
    }

    /// Host (and nothing else) for WebSocket URL construction.
    pub fn server_host(&self) -> &str {
        let host = self
            .server_url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        host.trim_end_matches('/')
    }

    /// `X-Qlik-User` header value asserting the configured identity.
    pub fn identity_header(&self) -> String {
        format!(
            "UserDirectory={}; UserId={}",
            self.user_directory, self.user_id
        )
    }
}

fn parse_port(
    raw: Option<String>,
    name: &'static str,
    default: u16,
) -> Result<u16, ConfigError> {
    match raw {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPort { name, value: v }),
    }
}

/// Configuration failures. All are raised before any I/O and are never
/// retried.
#[derive(Debug)]
pub enum ConfigError {
    /// A required variable is absent or blank.
    Missing(&'static str),
    /// A port variable does not parse as a port number.
    InvalidPort { name: &'static str, value: String },
    /// A client certificate was configured without its key (or vice versa);
    /// the named variable is the absent half.
    UnpairedIdentity(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(name) => {
                write!(f, "Missing required environment variable: {}", name)
            }
            ConfigError::InvalidPort { name, value } => {
                write!(f, "{} is not a valid port: {:?}", name, value)
            }
            ConfigError::UnpairedIdentity(name) => {
                write!(f, "Client TLS identity is incomplete: {} is not set", name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

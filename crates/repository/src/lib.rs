//! Repository (QRS) API client.
//!
//! Blocking HTTPS client for the management side of a Qlik Sense deployment:
//! app/user/stream/task listings, app metadata, task starts. The engine
//! protocol lives in `qsense-engine`; this API is plain REST under
//! `https://server:4242/qrs/`, authenticated by the same `X-Qlik-User`
//! identity header.

mod client;

pub use client::{RepositoryClient, RepositoryError, TaskKind};

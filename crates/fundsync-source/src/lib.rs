//! Bitable source clients for fundsync: the live Lark/Feishu client, a fixture-backed
//! source, and the retry/rate-limit plumbing they share.

use std::time::Duration;

use async_trait::async_trait;
use fundsync_core::{FieldDefinition, RawSourceRecord};
use thiserror::Error;

mod fixture;
mod lark;
mod throttle;

pub use fixture::{FixtureBundle, FixtureSource, FixtureTable};
pub use lark::{LarkBitableClient, LarkCredentials};
pub use throttle::{RequestQuota, RetryPolicy};

pub const CRATE_NAME: &str = "fundsync-source";

/// Read-only view of one Bitable app.
#[async_trait]
pub trait BitableSource: Send + Sync {
    /// Every record of a table, following pagination to the end.
    async fn list_records(&self, table_id: &str) -> Result<Vec<RawSourceRecord>, SourceError>;

    async fn list_fields(&self, table_id: &str) -> Result<Vec<FieldDefinition>, SourceError>;
}

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("request failed after {attempts} attempts: {message}")]
    Transient {
        attempts: usize,
        message: String,
        timed_out: bool,
    },
    #[error("bitable api error {code}: {msg}")]
    Api { code: i64, msg: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("fixture error: {0}")]
    Fixture(String),
}

impl SourceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SourceError::Auth(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SourceError::Transient { timed_out: true, .. })
    }

    /// Failures of the remote service itself. Malformed or missing payloads only
    /// spoil the table they came from.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            SourceError::Auth(_) | SourceError::Transient { .. } | SourceError::Api { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub page_size: u32,
    pub retry: RetryPolicy,
    /// Client-side cap on requests per second; `None` leaves pacing to the server.
    pub requests_per_second: Option<u32>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("fundsync/{}", env!("CARGO_PKG_VERSION"))),
            page_size: 100,
            retry: RetryPolicy::default(),
            requests_per_second: None,
        }
    }
}

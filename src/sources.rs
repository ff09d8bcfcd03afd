//! Collaborators the collector reads from.
//!
//! The HTTP implementation lives in [`crate::client`]; tests plug in fakes.

use async_trait::async_trait;

use crate::errors::ExporterError;
use crate::records::RawRecord;
use crate::snapshot::{FilesystemSize, NodePing, SystemInformation};

/// `system_information` for a set of attributes.
#[async_trait]
pub trait SystemInfoSource: Send + Sync {
    async fn system_information(&self, attributes: &[&str]) -> Result<SystemInformation, ExporterError>;
}

/// Analytics rows whose `id` (a millisecond timestamp) lies in `[start, end]`.
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    async fn analytics_between(&self, start: i64, end: i64) -> Result<Vec<RawRecord>, ExporterError>;
}

#[async_trait]
pub trait FilesystemSource: Send + Sync {
    async fn filesystem_sizes(&self) -> Result<Vec<FilesystemSize>, ExporterError>;
}

#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn ping_nodes(&self) -> Result<Vec<NodePing>, ExporterError>;
}

/// Who is calling, as HarperDB sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub username: String,
    pub super_user: bool,
}

/// Resolves the caller behind an `Authorization` header.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// `Ok(None)` when the credentials are rejected.
    async fn identify(&self, authorization: &str) -> Result<Option<Caller>, ExporterError>;
}

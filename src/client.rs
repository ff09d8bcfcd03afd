//! HarperDB operations API client.
//!
//! Every collaborator the exporter needs is one JSON `POST` to the operations
//! endpoint; this type implements all of the [`crate::sources`] traits on top
//! of a single `reqwest::Client`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::config::Settings;
use crate::errors::ExporterError;
use crate::records::RawRecord;
use crate::snapshot::{FilesystemSize, NodePing, SystemInformation};
use crate::sources::{
    AnalyticsSource, Caller, ClusterSource, FilesystemSource, IdentitySource, SystemInfoSource,
};

pub struct OperationsClient {
    http: Client,
    url: Url,
    username: String,
    password: String,
    ping_timeout: Duration,
}

enum Auth<'a> {
    /// The exporter's own configured account.
    Service,
    /// A caller's `Authorization` header, passed through untouched.
    Forward(&'a str),
}

impl OperationsClient {
    pub fn new(settings: &Settings) -> Result<Self, ExporterError> {
        let http = Client::builder()
            .user_agent(concat!("harperdb-exporter/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.request_timeout)
            .build()
            .map_err(|source| ExporterError::Upstream {
                operation: "client",
                source,
            })?;
        Ok(Self {
            http,
            url: settings.operations_url()?,
            username: settings.harperdb_username.clone(),
            password: settings.harperdb_password.clone(),
            ping_timeout: settings.cluster_ping_timeout,
        })
    }

    fn request(&self, body: &Value, auth: Auth<'_>) -> RequestBuilder {
        let req = self.http.post(self.url.clone()).json(body);
        match auth {
            Auth::Service => req.basic_auth(&self.username, Some(&self.password)),
            Auth::Forward(header) => req.header(reqwest::header::AUTHORIZATION, header),
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        req: RequestBuilder,
    ) -> Result<reqwest::Response, ExporterError> {
        debug!(operation, "Calling operations API");
        let resp = req
            .send()
            .await
            .map_err(|source| ExporterError::Upstream { operation, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExporterError::UpstreamStatus {
                operation,
                status,
                body,
            });
        }
        Ok(resp)
    }

    async fn decode<T: DeserializeOwned>(
        operation: &'static str,
        resp: reqwest::Response,
    ) -> Result<T, ExporterError> {
        let bytes = resp
            .bytes()
            .await
            .map_err(|source| ExporterError::Upstream { operation, source })?;
        serde_json::from_slice(&bytes).map_err(|source| ExporterError::Decode { operation, source })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        body: Value,
    ) -> Result<T, ExporterError> {
        let resp = self.send(operation, self.request(&body, Auth::Service)).await?;
        Self::decode(operation, resp).await
    }
}

#[async_trait]
impl SystemInfoSource for OperationsClient {
    async fn system_information(&self, attributes: &[&str]) -> Result<SystemInformation, ExporterError> {
        self.call(
            "system_information",
            json!({ "operation": "system_information", "attributes": attributes }),
        )
        .await
    }
}

#[async_trait]
impl AnalyticsSource for OperationsClient {
    async fn analytics_between(&self, start: i64, end: i64) -> Result<Vec<RawRecord>, ExporterError> {
        let rows: Vec<Value> = self
            .call(
                "search_by_conditions",
                json!({
                    "operation": "search_by_conditions",
                    "database": "system",
                    "table": "hdb_analytics",
                    "get_attributes": ["*"],
                    "conditions": [{
                        "search_attribute": "id",
                        "search_type": "between",
                        "search_value": [start, end]
                    }]
                }),
            )
            .await?;
        let total = rows.len();
        let records: Vec<RawRecord> = rows.into_iter().filter_map(RawRecord::from_value).collect();
        if records.len() != total {
            debug!(dropped = total - records.len(), "Skipped non-object analytics rows");
        }
        Ok(records)
    }
}

#[derive(Deserialize, Default)]
struct DiskInfo {
    #[serde(default)]
    disk: Option<DiskSection>,
}

#[derive(Deserialize, Default)]
struct DiskSection {
    #[serde(default)]
    size: Vec<FilesystemSize>,
}

#[async_trait]
impl FilesystemSource for OperationsClient {
    async fn filesystem_sizes(&self) -> Result<Vec<FilesystemSize>, ExporterError> {
        let info: DiskInfo = self
            .call(
                "system_information",
                json!({ "operation": "system_information", "attributes": ["disk"] }),
            )
            .await?;
        Ok(info.disk.map(|d| d.size).unwrap_or_default())
    }
}

#[derive(Deserialize, Default)]
struct ClusterNetwork {
    #[serde(default)]
    nodes: Vec<NodePing>,
}

#[async_trait]
impl ClusterSource for OperationsClient {
    async fn ping_nodes(&self) -> Result<Vec<NodePing>, ExporterError> {
        let operation = "cluster_network";
        let req = self
            .request(&json!({ "operation": operation }), Auth::Service)
            .timeout(self.ping_timeout);
        let resp = self.send(operation, req).await?;
        let network: ClusterNetwork = Self::decode(operation, resp).await?;
        Ok(network.nodes)
    }
}

#[derive(Deserialize)]
struct UserInfo {
    username: String,
    #[serde(default)]
    role: Option<Role>,
}

#[derive(Deserialize)]
struct Role {
    #[serde(default)]
    permission: Option<Permission>,
}

#[derive(Deserialize)]
struct Permission {
    #[serde(default)]
    super_user: bool,
}

#[async_trait]
impl IdentitySource for OperationsClient {
    async fn identify(&self, authorization: &str) -> Result<Option<Caller>, ExporterError> {
        let operation = "user_info";
        let req = self.request(&json!({ "operation": operation }), Auth::Forward(authorization));
        let resp = match self.send(operation, req).await {
            Ok(resp) => resp,
            Err(ExporterError::UpstreamStatus { status, .. })
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        let info: UserInfo = Self::decode(operation, resp).await?;
        Ok(Some(Caller {
            username: info.username,
            super_user: info
                .role
                .and_then(|r| r.permission)
                .map_or(false, |p| p.super_user),
        }))
    }
}

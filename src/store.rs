//! Exporter settings: authorization policy and custom metric rules.
//!
//! Persisted as JSON next to the exporter. The first process to start creates
//! the file with defaults; concurrent starters lose the exclusive-create race
//! and read what the winner wrote.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::ExporterError;
use crate::sources::Caller;

/// Maps one label of a custom summary to a field of the analytics record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelRule {
    pub label: String,
    pub metric_attribute: String,
}

/// Render any analytics record whose `metric_attribute` field equals `name`
/// as a summary called `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomMetricRule {
    pub name: String,
    pub metric_attribute: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub labels: Vec<LabelRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExporterSettings {
    #[serde(default)]
    pub force_authorization: bool,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub custom_metrics: Vec<CustomMetricRule>,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Forbidden,
}

/// Open unless `force_authorization` is set; then only listed users or super users.
pub fn authorize(settings: &ExporterSettings, caller: Option<&Caller>) -> Access {
    if !settings.force_authorization {
        return Access::Allowed;
    }
    match caller {
        Some(c) if settings.allowed_users.iter().any(|u| u == &c.username) => Access::Allowed,
        Some(c) if c.super_user => Access::Allowed,
        _ => Access::Forbidden,
    }
}

/// File-backed settings with an in-memory snapshot.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Arc<ExporterSettings>>,
}

impl SettingsStore {
    /// Load `path`, creating it with defaults if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ExporterError> {
        let path = path.into();
        let settings = match create_default(&path) {
            Ok(true) => {
                info!(path = %path.display(), "Initialised exporter settings with defaults");
                ExporterSettings::default()
            }
            Ok(false) => read(&path)?,
            Err(source) => return Err(ExporterError::SettingsIo { path, source }),
        };
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(settings)),
        })
    }

    /// A consistent view to hold for the length of one request.
    pub fn snapshot(&self) -> Arc<ExporterSettings> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Persist `settings` and make them current. In-flight scrapes keep the
    /// snapshot they started with.
    pub fn replace(&self, settings: ExporterSettings) -> Result<(), ExporterError> {
        write_atomic(&self.path, &settings)?;
        let next = Arc::new(settings);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        info!(path = %self.path.display(), "Exporter settings updated");
        Ok(())
    }

    /// Re-read the file, picking up edits made outside this process.
    pub fn reload(&self) -> Result<(), ExporterError> {
        let next = Arc::new(read(&self.path)?);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `Ok(true)` if this call created the file.
fn create_default(path: &Path) -> std::io::Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    let body = serde_json::to_vec_pretty(&ExporterSettings::default())?;
    file.write_all(&body)?;
    file.sync_all()?;
    Ok(true)
}

fn read(path: &Path) -> Result<ExporterSettings, ExporterError> {
    let bytes = fs::read(path).map_err(|source| ExporterError::SettingsIo {
        path: path.to_path_buf(),
        source,
    })?;
    // the winner of the create race may not have written yet
    if bytes.is_empty() {
        return Ok(ExporterSettings::default());
    }
    serde_json::from_slice(&bytes).map_err(|source| ExporterError::SettingsFormat {
        path: path.to_path_buf(),
        source,
    })
}

fn write_atomic(path: &Path, settings: &ExporterSettings) -> Result<(), ExporterError> {
    let io_err = |source| ExporterError::SettingsIo {
        path: path.to_path_buf(),
        source,
    };
    let body = serde_json::to_vec_pretty(settings).map_err(|source| ExporterError::SettingsFormat {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

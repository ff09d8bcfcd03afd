//! System information, filesystem and cluster-ping snapshots, and the fixed
//! field → series mapping that publishes them.
//!
//! Every section is optional: a HarperDB without clustering, replication or
//! some attribute simply contributes nothing for that part.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::errors::ExporterError;
use crate::metrics::{
    CLUSTER_PING, CPU, FS_AVAILABLE, FS_SIZE, FS_USED_RATIO, MEMORY, MEMORY_FIELDS,
    REPLICATION_BACKLOG, TABLE_FIELDS, THREADS,
};
use crate::registry::{Labels, MetricRegistry};

/// Attributes requested from `system_information` on every scrape.
pub const SYSTEM_ATTRIBUTES: [&str; 5] = [
    "database_metrics",
    "harperdb_processes",
    "threads",
    "replication",
    "memory",
];

type DatabaseMetrics = BTreeMap<String, BTreeMap<String, Map<String, Value>>>;

/// The subset of the `system_information` response the exporter reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemInformation {
    #[serde(default)]
    pub threads: Option<Vec<Value>>,
    #[serde(default)]
    pub harperdb_processes: Option<Processes>,
    /// Older servers answer `database_metrics` under `metrics`.
    #[serde(default)]
    pub metrics: Option<DatabaseMetrics>,
    #[serde(default)]
    pub database_metrics: Option<DatabaseMetrics>,
    #[serde(default)]
    pub memory: Option<Map<String, Value>>,
    #[serde(default)]
    pub replication: Option<Vec<ReplicationEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Processes {
    #[serde(default)]
    pub core: Vec<ProcessInfo>,
    #[serde(default)]
    pub clustering: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessInfo {
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub params: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplicationEntry {
    #[serde(default, alias = "name")]
    pub node: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub backlog: Option<f64>,
}

fn number(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64)
}

impl SystemInformation {
    fn databases(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, Map<String, Value>>)> {
        self.metrics
            .iter()
            .chain(self.database_metrics.iter())
            .flat_map(|dbs| dbs.iter())
    }

    /// Publish this snapshot into `registry`.
    pub fn apply(&self, registry: &MetricRegistry) -> Result<(), ExporterError> {
        let threads = self.threads.as_ref().map_or(0, Vec::len);
        registry.set(THREADS, &Labels::new(), Some(threads as f64))?;

        if let Some(processes) = &self.harperdb_processes {
            if let Some(core) = processes.core.first() {
                registry.set(CPU, &Labels::from([("process_name", "harperdb_core")]), core.cpu)?;
            }
            for process in &processes.clustering {
                let params = process.params.as_deref().unwrap_or_default();
                let name = if params.ends_with("hub.json") {
                    "harperdb_clustering_hub"
                } else if params.ends_with("leaf.json") {
                    "harperdb_clustering_leaf"
                } else {
                    continue;
                };
                registry.set(CPU, &Labels::from([("process_name", name)]), process.cpu)?;
            }
        }

        for (database, tables) in self.databases() {
            for (table, fields) in tables {
                let labels = Labels::from([("database", database.as_str()), ("table", table.as_str())]);
                for (field, series, _) in TABLE_FIELDS {
                    registry.set(series, &labels, number(fields, field))?;
                }
            }
        }

        if let Some(memory) = &self.memory {
            for field in MEMORY_FIELDS {
                if memory.contains_key(field) {
                    registry.set(MEMORY, &Labels::from([("type", field)]), number(memory, field))?;
                }
            }
        }

        for entry in self.replication.iter().flatten() {
            let labels = Labels::new()
                .with("node", entry.node.clone().unwrap_or_default())
                .with("database", entry.database.clone().unwrap_or_default());
            registry.set(REPLICATION_BACKLOG, &labels, entry.backlog)?;
        }

        Ok(())
    }
}

/// One mounted filesystem, as `system_information`'s `disk.size` reports it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilesystemSize {
    #[serde(default)]
    pub fs: String,
    #[serde(default, rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub mount: String,
    #[serde(default)]
    pub size: Option<f64>,
    #[serde(default)]
    pub available: Option<f64>,
    /// Percentage in use, 0-100.
    #[serde(default, rename = "use")]
    pub used_percent: Option<f64>,
}

pub fn apply_filesystems(
    registry: &MetricRegistry,
    filesystems: &[FilesystemSize],
) -> Result<(), ExporterError> {
    for fs in filesystems {
        let labels = Labels::new()
            .with("device", fs.fs.as_str())
            .with("fstype", fs.fs_type.as_str())
            .with("mountpoint", fs.mount.as_str());
        registry.set(FS_SIZE, &labels, fs.size)?;
        registry.set(FS_AVAILABLE, &labels, fs.available)?;
        registry.set(FS_USED_RATIO, &labels, fs.used_percent.map(|p| p / 100.0))?;
    }
    Ok(())
}

/// One node's answer to `cluster_network`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodePing {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub response_time: Option<f64>,
}

pub fn apply_cluster_ping(registry: &MetricRegistry, nodes: &[NodePing]) -> Result<(), ExporterError> {
    for node in nodes {
        registry.set(
            CLUSTER_PING,
            &Labels::from([("node", node.name.as_str())]),
            node.response_time,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::build_registry;
    use serde_json::json;

    fn info(value: Value) -> SystemInformation {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn processes_and_tables_are_mapped() {
        let (registry, _) = build_registry().unwrap();
        info(json!({
            "threads": [{}, {}, {}],
            "harperdb_processes": {
                "core": [{"cpu": 12.5}],
                "clustering": [
                    {"cpu": 1.0, "params": "/hdb/clustering/hub.json"},
                    {"cpu": 2.0, "params": "/hdb/clustering/leaf.json"},
                    {"cpu": 3.0, "params": "other"}
                ]
            },
            "metrics": {"data": {"dog": {"puts": 7, "timeSync": 1.5}}}
        }))
        .apply(&registry)
        .unwrap();

        assert_eq!(registry.read(THREADS, &Labels::new()).unwrap(), Some(3.0));
        let core = Labels::from([("process_name", "harperdb_core")]);
        assert_eq!(registry.read(CPU, &core).unwrap(), Some(12.5));
        let leaf = Labels::from([("process_name", "harperdb_clustering_leaf")]);
        assert_eq!(registry.read(CPU, &leaf).unwrap(), Some(2.0));

        let dog = Labels::from([("database", "data"), ("table", "dog")]);
        assert_eq!(registry.read("harperdb_table_puts_total", &dog).unwrap(), Some(7.0));
        assert_eq!(registry.read("harperdb_table_time_sync_total", &dog).unwrap(), Some(1.5));
        // fields absent from the snapshot read as zero
        assert_eq!(registry.read("harperdb_table_deletes_total", &dog).unwrap(), Some(0.0));
    }

    #[test]
    fn newer_database_metrics_key_is_read() {
        let (registry, _) = build_registry().unwrap();
        info(json!({"database_metrics": {"prod": {"orders": {"txns": 2}}}}))
            .apply(&registry)
            .unwrap();
        let orders = Labels::from([("database", "prod"), ("table", "orders")]);
        assert_eq!(registry.read("harperdb_table_txns_total", &orders).unwrap(), Some(2.0));
    }

    #[test]
    fn absent_sections_are_skipped() {
        let (registry, _) = build_registry().unwrap();
        info(json!({"threads": null, "harperdb_processes": {"core": [], "clustering": []}}))
            .apply(&registry)
            .unwrap();
        let text = registry.serialize().unwrap();
        assert!(text.contains("harperdb_process_threads_count 0"));
        assert!(!text.contains(CPU));
        assert!(!text.contains("harperdb_table_"));
    }

    #[test]
    fn memory_and_replication() {
        let (registry, _) = build_registry().unwrap();
        info(json!({
            "memory": {"total": 1024, "free": 512, "swaptotal": 0},
            "replication": [{"name": "node-b", "database": "data", "backlog": 9}]
        }))
        .apply(&registry)
        .unwrap();
        assert_eq!(registry.read(MEMORY, &Labels::from([("type", "free")])).unwrap(), Some(512.0));
        assert_eq!(registry.read(MEMORY, &Labels::from([("type", "used")])).unwrap(), None);
        let labels = Labels::from([("node", "node-b"), ("database", "data")]);
        assert_eq!(registry.read(REPLICATION_BACKLOG, &labels).unwrap(), Some(9.0));
    }

    #[test]
    fn filesystem_and_ping() {
        let (registry, _) = build_registry().unwrap();
        let filesystems: Vec<FilesystemSize> = serde_json::from_value(json!([
            {"fs": "/dev/sda1", "type": "ext4", "mount": "/", "size": 1000, "available": 250, "use": 75}
        ]))
        .unwrap();
        apply_filesystems(&registry, &filesystems).unwrap();
        apply_cluster_ping(&registry, &[NodePing { name: "n1".into(), response_time: Some(4.0) }]).unwrap();

        let root = Labels::from([("device", "/dev/sda1"), ("fstype", "ext4"), ("mountpoint", "/")]);
        assert_eq!(registry.read(FS_USED_RATIO, &root).unwrap(), Some(0.75));
        assert_eq!(registry.read(FS_AVAILABLE, &root).unwrap(), Some(250.0));
        assert_eq!(
            registry.read(CLUSTER_PING, &Labels::from([("node", "n1")])).unwrap(),
            Some(4.0)
        );
    }
}

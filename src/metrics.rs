//! Series declarations and the exporter's own metrics.

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounter, Opts};

use crate::errors::ExporterError;
use crate::registry::{MetricRegistry, SeriesDecl};

// system information
pub const THREADS: &str = "harperdb_process_threads_count";
pub const CPU: &str = "harperdb_process_cpu_utilization";
pub const MEMORY: &str = "harperdb_memory_bytes";
pub const REPLICATION_BACKLOG: &str = "harperdb_replication_backlog";
pub const FS_SIZE: &str = "harperdb_filesystem_size_bytes";
pub const FS_AVAILABLE: &str = "harperdb_filesystem_available_bytes";
pub const FS_USED_RATIO: &str = "harperdb_filesystem_used_ratio";
pub const CLUSTER_PING: &str = "harperdb_cluster_ping_ms";

// analytics
pub const CONNECTION: &str = "connection";
pub const OPEN_CONNECTIONS: &str = "open_connections";
pub const ACL_FAIL: &str = "acl_fail";
pub const BYTES_SENT: &str = "bytes_sent";
pub const MESSAGES_SENT: &str = "messages_sent";
pub const BYTES_RECEIVED: &str = "bytes_received";
pub const MESSAGES_RECEIVED: &str = "messages_received";
pub const CACHE_HIT: &str = "cache_hit";
pub const CACHE_MISS: &str = "cache_miss";
pub const SUCCESS: &str = "success";
pub const RESPONSE_STATUS: &str = "response_status_code";

/// Per-table storage counters: `(system_information field, series, help)`.
pub const TABLE_FIELDS: [(&str, &str, &str); 10] = [
    ("puts", "harperdb_table_puts_total", "Total number of non-delete writes by table"),
    ("deletes", "harperdb_table_deletes_total", "Total number of deletes by table"),
    ("txns", "harperdb_table_txns_total", "Total number of transactions by table"),
    (
        "pageFlushes",
        "harperdb_table_page_flushes_total",
        "Total number of times all pages are flushed by table",
    ),
    ("writes", "harperdb_table_writes_total", "Total number of disk write operations by table"),
    (
        "pagesWritten",
        "harperdb_table_pages_written_total",
        "Total number of pages written to disk by table. This is higher than writes because sequential pages can be written in a single write operation.",
    ),
    (
        "timeDuringTxns",
        "harperdb_table_time_during_txns_total",
        "Total time from when transaction was started (lock acquired) until finished and all writes have been made (but not necessarily flushed/synced to disk) by table",
    ),
    (
        "timeStartTxns",
        "harperdb_table_time_start_txns_total",
        "Total time spent waiting for transaction lock acquisition by table",
    ),
    (
        "timePageFlushes",
        "harperdb_table_time_page_flushes_total",
        "Total time spent on write calls by table",
    ),
    (
        "timeSync",
        "harperdb_table_time_sync_total",
        "Total time spent waiting for writes to sync/flush to disk by table",
    ),
];

/// `memory` fields exported under [`MEMORY`], keyed by the `type` label.
pub const MEMORY_FIELDS: [&str; 5] = ["total", "free", "used", "active", "available"];

/// Every gauge/counter series the collector populates.
pub static SERIES: Lazy<Vec<SeriesDecl>> = Lazy::new(|| {
    let traffic = ["protocol", "action", "topic"];
    let mut decls = vec![
        SeriesDecl::gauge(THREADS, "Number of threads in the HarperDB core process", &[]),
        SeriesDecl::gauge(CPU, "CPU utilization of a HarperDB process", &["process_name"]),
        SeriesDecl::gauge(MEMORY, "Host memory reported by HarperDB, by type", &["type"]),
        SeriesDecl::gauge(
            REPLICATION_BACKLOG,
            "Replication messages waiting to be sent, by node and database",
            &["node", "database"],
        ),
        SeriesDecl::gauge(
            FS_SIZE,
            "Filesystem size in bytes",
            &["device", "fstype", "mountpoint"],
        ),
        SeriesDecl::gauge(
            FS_AVAILABLE,
            "Filesystem space available in bytes",
            &["device", "fstype", "mountpoint"],
        ),
        SeriesDecl::gauge(
            FS_USED_RATIO,
            "Fraction of the filesystem in use (0-1)",
            &["device", "fstype", "mountpoint"],
        ),
        SeriesDecl::gauge(CLUSTER_PING, "Cluster node ping response time in milliseconds", &["node"]),
        SeriesDecl::gauge(
            CONNECTION,
            "Connection attempts (total), successes and failures by protocol and action",
            &["protocol", "action", "type"],
        ),
        SeriesDecl::gauge(OPEN_CONNECTIONS, "Currently open connections by protocol", &["protocol"]),
        SeriesDecl::gauge(ACL_FAIL, "Failed ACL checks by topic", &["topic"]),
        SeriesDecl::gauge(BYTES_SENT, "Bytes sent by protocol, action and topic", &traffic),
        SeriesDecl::gauge(MESSAGES_SENT, "Messages sent by protocol, action and topic", &traffic),
        SeriesDecl::gauge(BYTES_RECEIVED, "Bytes received by protocol, action and topic", &traffic),
        SeriesDecl::gauge(
            MESSAGES_RECEIVED,
            "Messages received by protocol, action and topic",
            &traffic,
        ),
        SeriesDecl::gauge(CACHE_HIT, "Cache hits by table", &["table"]),
        SeriesDecl::gauge(CACHE_MISS, "Cache misses by table", &["table"]),
        SeriesDecl::gauge(
            SUCCESS,
            "Successful and total requests by path, method and type",
            &["path", "method", "type", "label"],
        ),
        SeriesDecl::gauge(
            RESPONSE_STATUS,
            "Responses by HTTP status code",
            &["path", "method", "status_code"],
        ),
    ];
    decls.extend(
        TABLE_FIELDS
            .iter()
            .map(|(_, name, help)| SeriesDecl::gauge(name, help, &["database", "table"])),
    );
    decls
});

/// Help texts for the built-in summaries.
pub const TTFB_HELP: &str = "Time to first byte by type, path and method";
pub const DURATION_HELP: &str = "Request duration by type, path and method";
pub const TRANSFER_HELP: &str = "Response transfer time by type, path and method";
pub const CACHE_RESOLUTION_HELP: &str = "Time to resolve a cache miss by table";
pub const REPLICATION_LATENCY_HELP: &str = "Replication latency by origin, database and table";

/// The exporter's view of itself. Registered once, never reset.
#[derive(Clone)]
pub struct ExporterMetrics {
    pub scrapes: IntCounter,
    pub scrape_errors: IntCounter,
    pub scrape_duration: Histogram,
}

impl ExporterMetrics {
    pub fn register(registry: &mut MetricRegistry) -> Result<Self, ExporterError> {
        let scrapes = IntCounter::with_opts(Opts::new(
            "harperdb_exporter_scrapes_total",
            "Total number of completed metric requests",
        ))?;
        let scrape_errors = IntCounter::with_opts(Opts::new(
            "harperdb_exporter_scrape_errors_total",
            "Total number of metric requests that failed upstream",
        ))?;
        let scrape_duration = Histogram::with_opts(HistogramOpts::new(
            "harperdb_exporter_scrape_duration_seconds",
            "Duration of one scrape cycle in seconds",
        ))?;

        registry.register_static(Box::new(scrapes.clone()))?;
        registry.register_static(Box::new(scrape_errors.clone()))?;
        registry.register_static(Box::new(scrape_duration.clone()))?;

        Ok(Self {
            scrapes,
            scrape_errors,
            scrape_duration,
        })
    }
}

/// Register the default process collector (CPU, RSS, open fds, ...).
#[cfg(target_os = "linux")]
pub fn register_process_metrics(registry: &mut MetricRegistry) -> Result<(), ExporterError> {
    registry.register_static(Box::new(
        prometheus::process_collector::ProcessCollector::for_self(),
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn register_process_metrics(_registry: &mut MetricRegistry) -> Result<(), ExporterError> {
    Ok(())
}

/// A registry with every series declared and the exporter metrics attached.
pub fn build_registry() -> Result<(MetricRegistry, ExporterMetrics), ExporterError> {
    let mut registry = MetricRegistry::new();
    registry.declare_all(SERIES.iter().cloned())?;
    let exporter = ExporterMetrics::register(&mut registry)?;
    Ok((registry, exporter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_table_has_no_collisions() {
        let (registry, _) = build_registry().unwrap();
        assert_eq!(registry.declarations().count(), SERIES.len());
        let decl = registry.declaration("harperdb_table_puts_total").unwrap();
        assert_eq!(decl.label_names, vec!["database", "table"]);
    }

    #[test]
    fn exporter_metrics_survive_reset() {
        let (registry, exporter) = build_registry().unwrap();
        exporter.scrapes.inc();
        registry.reset_all();
        let text = registry.serialize().unwrap();
        assert!(text.contains("harperdb_exporter_scrapes_total 1"));
    }

    #[test]
    fn family_names_include_static_collectors() {
        let (registry, _) = build_registry().unwrap();
        let names: Vec<&str> = registry.family_names().collect();
        assert!(names.contains(&"harperdb_table_puts_total"));
        assert!(names.contains(&"harperdb_exporter_scrapes_total"));
        assert!(names.contains(&"harperdb_exporter_scrape_duration_seconds"));
    }
}

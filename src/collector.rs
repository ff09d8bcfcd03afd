//! One scrape cycle: reset, fetch, dispatch, render.
//!
//! Scrapes are serialized behind a single async mutex that covers the whole
//! cycle, serialization included, so overlapping requests can never see one
//! another's half-populated registry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::ExporterError;
use crate::metrics::{
    ExporterMetrics, ACL_FAIL, BYTES_RECEIVED, BYTES_SENT, CACHE_HIT, CACHE_MISS,
    CACHE_RESOLUTION_HELP, CONNECTION, DURATION_HELP, MESSAGES_RECEIVED, MESSAGES_SENT,
    OPEN_CONNECTIONS, REPLICATION_LATENCY_HELP, RESPONSE_STATUS, SUCCESS, TRANSFER_HELP,
    TTFB_HELP,
};
use crate::records::{AnalyticsRecord, LatencyMetric, RawRecord, Traffic};
use crate::registry::{Labels, MetricRegistry};
use crate::snapshot::{apply_cluster_ping, apply_filesystems, NodePing, SYSTEM_ATTRIBUTES};
use crate::sources::{AnalyticsSource, ClusterSource, FilesystemSource, SystemInfoSource};
use crate::store::{CustomMetricRule, ExporterSettings, SettingsStore};
use crate::summary::{sanitize_name, SummaryRenderer};

/// Built-in summary names; custom rules may not reuse them.
const SUMMARY_NAMES: [&str; 5] = ["TTFB", "duration", "transfer", "cache_resolution", "replication_latency"];

/// The `[start, end]` millisecond range queried from analytics.
///
/// Always 1.5x the aggregation period wide, so consecutive scrapes overlap the
/// upstream aggregation buckets instead of falling between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeWindow {
    pub start: i64,
    pub end: i64,
}

impl ScrapeWindow {
    pub fn ending_at(end: i64, aggregate_period: Duration) -> Self {
        let width = aggregate_period.mul_f64(1.5).as_millis() as i64;
        Self {
            start: end - width,
            end,
        }
    }

    pub fn width(&self) -> i64 {
        self.end - self.start
    }
}

/// Everything the collector reads from.
#[derive(Clone)]
pub struct Sources {
    pub system: Arc<dyn SystemInfoSource>,
    pub analytics: Arc<dyn AnalyticsSource>,
    pub filesystem: Arc<dyn FilesystemSource>,
    pub cluster: Arc<dyn ClusterSource>,
}

impl Sources {
    /// All four roles served by one implementation.
    pub fn from_one<T>(source: Arc<T>) -> Self
    where
        T: SystemInfoSource + AnalyticsSource + FilesystemSource + ClusterSource + 'static,
    {
        Self {
            system: source.clone(),
            analytics: source.clone(),
            filesystem: source.clone(),
            cluster: source,
        }
    }
}

struct ScrapeState {
    registry: MetricRegistry,
    renderer: SummaryRenderer,
}

/// Aborts the wrapped task if the scrape is dropped before it is awaited.
struct Detached<T>(JoinHandle<T>);

impl<T> Drop for Detached<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Collector {
    state: Mutex<ScrapeState>,
    exporter: ExporterMetrics,
    sources: Sources,
    settings: Arc<SettingsStore>,
    // every family name the registry can emit; custom rules may not reuse them
    reserved: Vec<String>,
    aggregate_period: Duration,
    ping_timeout: Duration,
}

impl Collector {
    pub fn new(
        registry: MetricRegistry,
        exporter: ExporterMetrics,
        sources: Sources,
        settings: Arc<SettingsStore>,
        aggregate_period: Duration,
        ping_timeout: Duration,
    ) -> Self {
        let reserved = registry.family_names().map(str::to_string).collect();
        Self {
            reserved,
            state: Mutex::new(ScrapeState {
                registry,
                renderer: SummaryRenderer::new(),
            }),
            exporter,
            sources,
            settings,
            aggregate_period,
            ping_timeout,
        }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Run one full scrape and return the exposition text.
    pub async fn scrape(&self) -> Result<String, ExporterError> {
        let mut state = self.state.lock().await;
        let _timer = self.exporter.scrape_duration.start_timer();
        let started = Instant::now();

        let result = self.scrape_locked(&mut state).await;
        match &result {
            Ok(_) => debug!(duration_s = started.elapsed().as_secs_f64(), "Scrape complete"),
            Err(e) => {
                self.exporter.scrape_errors.inc();
                warn!(error = %e, "Scrape failed");
            }
        }
        result
    }

    async fn scrape_locked(&self, state: &mut ScrapeState) -> Result<String, ExporterError> {
        state.registry.reset_all();
        state.renderer.reset();

        // one rule set for the whole scrape
        let settings = self.settings.snapshot();
        let window = ScrapeWindow::ending_at(Utc::now().timestamp_millis(), self.aggregate_period);
        let ping = self.spawn_ping();

        let (info, records, filesystems) = futures::try_join!(
            self.sources.system.system_information(&SYSTEM_ATTRIBUTES),
            self.sources.analytics.analytics_between(window.start, window.end),
            self.sources.filesystem.filesystem_sizes(),
        )?;

        info.apply(&state.registry)?;
        apply_filesystems(&state.registry, &filesystems)?;

        let total = records.len();
        for raw in records {
            dispatch(
                &state.registry,
                &mut state.renderer,
                &settings.custom_metrics,
                AnalyticsRecord::from(raw),
            )?;
        }

        if let Some(nodes) = finish_ping(ping).await {
            apply_cluster_ping(&state.registry, &nodes)?;
        }

        debug!(
            records = total,
            summaries = state.renderer.blocks(),
            start = window.start,
            end = window.end,
            "Analytics dispatched"
        );

        self.exporter.scrapes.inc();
        let summaries = state.renderer.flush();
        let body = state.registry.serialize()?;
        // summary text always ends in a newline
        Ok(summaries + &body)
    }

    fn spawn_ping(&self) -> Detached<Option<Vec<NodePing>>> {
        let cluster = Arc::clone(&self.sources.cluster);
        let bound = self.ping_timeout;
        Detached(tokio::spawn(async move {
            match tokio::time::timeout(bound, cluster.ping_nodes()).await {
                Ok(Ok(nodes)) => Some(nodes),
                // expected on every scrape of a server without clustering
                Ok(Err(e)) => {
                    debug!(error = %e, "Cluster ping failed; leaving it out of this scrape");
                    None
                }
                Err(_) => {
                    warn!(timeout_s = bound.as_secs_f64(), "Cluster ping timed out; leaving it out of this scrape");
                    None
                }
            }
        }))
    }

    /// Reject rule sets that would emit a family twice.
    pub fn validate_settings(&self, settings: &ExporterSettings) -> Result<(), String> {
        validate_rules(&settings.custom_metrics, &self.reserved)
    }
}

async fn finish_ping(mut ping: Detached<Option<Vec<NodePing>>>) -> Option<Vec<NodePing>> {
    (&mut ping.0).await.unwrap_or(None)
}

fn validate_rules(rules: &[CustomMetricRule], reserved: &[String]) -> Result<(), String> {
    for rule in rules {
        if rule.name.is_empty() || rule.metric_attribute.is_empty() {
            return Err("custom metrics need a `name` and a `metricAttribute`".into());
        }
        let name = sanitize_name(&rule.name);
        if reserved.iter().any(|r| r == &name) || SUMMARY_NAMES.contains(&name.as_str()) {
            return Err(format!("custom metric `{}` collides with a built-in series", rule.name));
        }

        let mut seen = HashSet::new();
        for label in &rule.labels {
            let label_name = sanitize_name(&label.label);
            if label.label.is_empty() || label_name == "quantile" || label_name.starts_with("__") {
                return Err(format!(
                    "custom metric `{}` cannot use the label name `{}`",
                    rule.name, label.label
                ));
            }
            if !seen.insert(label_name) {
                return Err(format!(
                    "custom metric `{}` lists the label `{}` twice",
                    rule.name, label.label
                ));
            }
        }
    }
    Ok(())
}

fn set_traffic(
    registry: &MetricRegistry,
    bytes_series: &str,
    messages_series: &str,
    traffic: &Traffic,
) -> Result<(), ExporterError> {
    let labels = Labels::new()
        .with("protocol", traffic.protocol.as_str())
        .with("action", traffic.action.as_str())
        .with("topic", traffic.topic.as_str());
    registry.set(bytes_series, &labels, Some(traffic.bytes()))?;
    registry.set(messages_series, &labels, Some(traffic.messages))
}

/// Publish one analytics record, either into the registry or as summary text.
pub fn dispatch(
    registry: &MetricRegistry,
    renderer: &mut SummaryRenderer,
    rules: &[CustomMetricRule],
    record: AnalyticsRecord,
) -> Result<(), ExporterError> {
    match record {
        AnalyticsRecord::Connection {
            protocol,
            action,
            attempts,
            successes,
        } => {
            let base = Labels::new()
                .with("protocol", protocol)
                .with("action", action);
            registry.set(CONNECTION, &base.clone().with("type", "total"), Some(attempts))?;
            registry.set(CONNECTION, &base.clone().with("type", "success"), Some(successes))?;
            registry.set(CONNECTION, &base.with("type", "failed"), Some(attempts - successes))?;
        }
        AnalyticsRecord::MqttConnections { open } => {
            registry.set(OPEN_CONNECTIONS, &Labels::from([("protocol", "mqtt")]), Some(open))?;
        }
        AnalyticsRecord::WsConnections { open } => {
            registry.set(OPEN_CONNECTIONS, &Labels::from([("protocol", "ws")]), Some(open))?;
        }
        AnalyticsRecord::AclFail { topic, total } => {
            registry.set(ACL_FAIL, &Labels::new().with("topic", topic), Some(total))?;
        }
        AnalyticsRecord::BytesSent(traffic) => {
            set_traffic(registry, BYTES_SENT, MESSAGES_SENT, &traffic)?;
        }
        AnalyticsRecord::BytesReceived(traffic) => {
            set_traffic(registry, BYTES_RECEIVED, MESSAGES_RECEIVED, &traffic)?;
        }
        AnalyticsRecord::CacheHit {
            table,
            lookups,
            hits,
        } => {
            let labels = Labels::new().with("table", table);
            registry.set(CACHE_HIT, &labels, Some(hits))?;
            registry.set(CACHE_MISS, &labels, Some(lookups - hits))?;
        }
        AnalyticsRecord::Success {
            path,
            method,
            kind,
            total,
            successes,
        } => {
            let base = Labels::new()
                .with("path", path)
                .with("method", method)
                .with("type", kind);
            registry.set(SUCCESS, &base.clone().with("label", "total"), Some(total))?;
            registry.set(SUCCESS, &base.with("label", "success"), Some(successes))?;
        }
        AnalyticsRecord::Latency {
            metric,
            kind,
            path,
            method,
            quantiles,
        } => {
            let help = match metric {
                LatencyMetric::Ttfb => TTFB_HELP,
                LatencyMetric::Duration => DURATION_HELP,
                LatencyMetric::Transfer => TRANSFER_HELP,
            };
            renderer.render(
                metric.name(),
                help,
                &[("type", kind.as_str()), ("path", path.as_str()), ("method", method.as_str())],
                &quantiles,
            );
        }
        AnalyticsRecord::CacheResolution { table, quantiles } => {
            renderer.render("cache_resolution", CACHE_RESOLUTION_HELP, &[("table", table.as_str())], &quantiles);
        }
        AnalyticsRecord::ReplicationLatency {
            origin,
            database,
            table,
            quantiles,
        } => {
            renderer.render(
                "replication_latency",
                REPLICATION_LATENCY_HELP,
                &[
                    ("origin", origin.as_str()),
                    ("database", database.as_str()),
                    ("table", table.as_str()),
                ],
                &quantiles,
            );
        }
        AnalyticsRecord::ResponseStatus {
            code,
            path,
            method,
            count,
        } => {
            let labels = Labels::new()
                .with("path", path)
                .with("method", method)
                .with("status_code", code);
            registry.set(RESPONSE_STATUS, &labels, Some(count))?;
        }
        AnalyticsRecord::Other(raw) => apply_custom_rules(renderer, rules, &raw),
    }
    Ok(())
}

fn apply_custom_rules(renderer: &mut SummaryRenderer, rules: &[CustomMetricRule], raw: &RawRecord) {
    let mut matched = false;
    for rule in rules {
        let hit = matches!(raw.get(&rule.metric_attribute), Some(serde_json::Value::String(v)) if v == &rule.name);
        if !hit {
            continue;
        }
        matched = true;
        let values: Vec<(String, String)> = rule
            .labels
            .iter()
            .map(|l| (l.label.clone(), raw.text(&l.metric_attribute)))
            .collect();
        let labels: Vec<(&str, &str)> = values.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let help = if rule.help.is_empty() {
            format!("Custom metric {}", rule.name)
        } else {
            rule.help.clone()
        };
        renderer.render(&rule.name, &help, &labels, &raw.quantiles());
    }
    if !matched {
        debug!(metric = %raw.text("metric"), "No mapping for analytics record; dropped");
    }
}

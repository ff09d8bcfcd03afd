//! Explicit registry of every gauge/counter series the exporter publishes.
//!
//! A [`MetricRegistry`] is built once at startup from a declaration table and
//! then owned by the collector. Each scrape calls [`MetricRegistry::reset_all`]
//! before repopulating, so a label tuple with no activity in the current window
//! disappears (or reads zero) instead of repeating its last value.

use std::collections::{BTreeMap, HashMap};

use prometheus::core::Collector;
use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

use crate::errors::ExporterError;
use crate::summary::escape_label_value;

/// Kind of a declared series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesKind {
    Gauge,
    Counter,
}

/// Static description of one exposed series.
#[derive(Debug, Clone)]
pub struct SeriesDecl {
    pub name: String,
    pub kind: SeriesKind,
    pub help: String,
    pub label_names: Vec<String>,
}

impl SeriesDecl {
    pub fn gauge(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self::new(name, SeriesKind::Gauge, help, label_names)
    }

    pub fn counter(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self::new(name, SeriesKind::Counter, help, label_names)
    }

    fn new(name: &str, kind: SeriesKind, help: &str, label_names: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            help: help.to_string(),
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
        }
    }
}

/// Label name → value mapping identifying one observation of a series.
///
/// Ordered by label name, which is also the order the text encoder emits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn as_map(&self) -> HashMap<&str, &str> {
        self.iter().collect()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Labels {
    fn from(pairs: [(&str, &str); N]) -> Self {
        pairs
            .into_iter()
            .fold(Labels::new(), |labels, (k, v)| labels.with(k, v))
    }
}

/// Fail-safe to zero: absent or non-numeric source values read as no activity.
pub fn coerce(value: Option<f64>) -> f64 {
    match value {
        Some(v) if !v.is_nan() => v,
        _ => 0.0,
    }
}

enum Handle {
    Gauge(Gauge),
    GaugeVec(GaugeVec),
    Counter(Counter),
    CounterVec(CounterVec),
}

impl Handle {
    fn build(decl: &SeriesDecl) -> Result<Self, ExporterError> {
        let opts = Opts::new(decl.name.clone(), decl.help.clone());
        let labels: Vec<&str> = decl.label_names.iter().map(String::as_str).collect();
        let handle = match (decl.kind, labels.is_empty()) {
            (SeriesKind::Gauge, true) => Handle::Gauge(Gauge::with_opts(opts)?),
            (SeriesKind::Gauge, false) => Handle::GaugeVec(GaugeVec::new(opts, &labels)?),
            (SeriesKind::Counter, true) => Handle::Counter(Counter::with_opts(opts)?),
            (SeriesKind::Counter, false) => Handle::CounterVec(CounterVec::new(opts, &labels)?),
        };
        Ok(handle)
    }

    fn collector(&self) -> Box<dyn Collector> {
        match self {
            Handle::Gauge(g) => Box::new(g.clone()),
            Handle::GaugeVec(g) => Box::new(g.clone()),
            Handle::Counter(c) => Box::new(c.clone()),
            Handle::CounterVec(c) => Box::new(c.clone()),
        }
    }

    fn reset(&self) {
        match self {
            // A label-less gauge is always exported, so "reset" means zero.
            Handle::Gauge(g) => g.set(0.0),
            Handle::GaugeVec(g) => g.reset(),
            Handle::Counter(c) => c.reset(),
            Handle::CounterVec(c) => c.reset(),
        }
    }

    fn set(&self, labels: &Labels, value: f64) -> Result<(), prometheus::Error> {
        match self {
            Handle::Gauge(g) => {
                no_labels(labels)?;
                g.set(value);
            }
            Handle::GaugeVec(g) => g.get_metric_with(&labels.as_map())?.set(value),
            Handle::Counter(c) => {
                no_labels(labels)?;
                c.reset();
                c.inc_by(value.max(0.0));
            }
            Handle::CounterVec(c) => {
                let counter = c.get_metric_with(&labels.as_map())?;
                counter.reset();
                counter.inc_by(value.max(0.0));
            }
        }
        Ok(())
    }
}

fn no_labels(labels: &Labels) -> Result<(), prometheus::Error> {
    if labels.is_empty() {
        Ok(())
    } else {
        Err(prometheus::Error::InconsistentCardinality {
            expect: 0,
            got: labels.len(),
        })
    }
}

struct Series {
    decl: SeriesDecl,
    handle: Handle,
}

/// Holds the current value of every declared series.
pub struct MetricRegistry {
    inner: Registry,
    series: HashMap<String, Series>,
    // declaration order, for deterministic iteration
    order: Vec<String>,
    static_names: Vec<String>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            inner: Registry::new(),
            series: HashMap::new(),
            order: Vec::new(),
            static_names: Vec::new(),
        }
    }

    /// Register a new series. Name collisions are configuration errors.
    pub fn declare(&mut self, decl: SeriesDecl) -> Result<(), ExporterError> {
        if self.series.contains_key(&decl.name) {
            return Err(ExporterError::DuplicateSeries(decl.name));
        }
        let handle = Handle::build(&decl)?;
        self.inner.register(handle.collector())?;
        self.order.push(decl.name.clone());
        self.series.insert(decl.name.clone(), Series { decl, handle });
        Ok(())
    }

    /// Declare every entry of a table, stopping at the first failure.
    pub fn declare_all(
        &mut self,
        decls: impl IntoIterator<Item = SeriesDecl>,
    ) -> Result<(), ExporterError> {
        decls.into_iter().try_for_each(|decl| self.declare(decl))
    }

    /// Register a collector that is not reset between scrapes
    /// (the exporter's own counters, process metrics).
    pub fn register_static(&mut self, collector: Box<dyn Collector>) -> Result<(), ExporterError> {
        let names: Vec<String> = collector.desc().iter().map(|d| d.fq_name.clone()).collect();
        self.inner.register(collector)?;
        self.static_names.extend(names);
        Ok(())
    }

    /// Every family name this registry can emit, declared or static.
    pub fn family_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().chain(&self.static_names).map(String::as_str)
    }

    pub fn declaration(&self, name: &str) -> Option<&SeriesDecl> {
        self.series.get(name).map(|s| &s.decl)
    }

    pub fn declarations(&self) -> impl Iterator<Item = &SeriesDecl> {
        self.order.iter().filter_map(|name| self.declaration(name))
    }

    pub fn reset(&self, name: &str) -> Result<(), ExporterError> {
        self.get(name)?.handle.reset();
        Ok(())
    }

    pub fn reset_all(&self) {
        self.series.values().for_each(|s| s.handle.reset());
    }

    /// Upsert one observation. `None` and NaN are stored as zero.
    pub fn set(&self, name: &str, labels: &Labels, value: Option<f64>) -> Result<(), ExporterError> {
        let series = self.get(name)?;
        series
            .handle
            .set(labels, coerce(value))
            .map_err(|source| ExporterError::LabelMismatch {
                series: name.to_string(),
                source,
            })
    }

    /// Current value of one observation, if it has been set since the last reset.
    pub fn read(&self, name: &str, labels: &Labels) -> Result<Option<f64>, ExporterError> {
        self.get(name)?;
        let key = sample_key(name, labels);
        let text = self.serialize()?;
        Ok(text
            .lines()
            .filter(|line| !line.starts_with('#'))
            .find_map(|line| line.strip_prefix(key.as_str())?.strip_prefix(' '))
            .and_then(|value| value.trim().parse().ok()))
    }

    /// Exposition text for everything registered, declared series and static collectors alike.
    pub fn serialize(&self) -> Result<String, ExporterError> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.inner.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| ExporterError::Prometheus(prometheus::Error::Msg(e.to_string())))
    }

    fn get(&self, name: &str) -> Result<&Series, ExporterError> {
        self.series
            .get(name)
            .ok_or_else(|| ExporterError::UnknownSeries(name.to_string()))
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn sample_key(name: &str, labels: &Labels) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect();
    format!("{name}{{{}}}", pairs.join(","))
}

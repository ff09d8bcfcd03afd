//! Text rendering for precomputed quantile summaries.
//!
//! HarperDB's analytics already aggregate latencies into percentiles, and the
//! `prometheus` crate has no way to ingest externally computed quantiles, so
//! these series are written straight to exposition text here and prepended to
//! the registry output.

use std::collections::HashMap;
use std::fmt::Write;

/// Appended to every summary HELP line.
pub const SUM_NOTE: &str = "(_sum is approximated as mean * count)";

/// One upstream percentile summary. Missing fields are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Quantiles {
    pub p1: f64,
    pub p10: f64,
    pub p25: f64,
    pub median: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub count: f64,
}

impl Quantiles {
    /// Reconstructed sum. Upstream only keeps the mean, so this is `mean * count`
    /// and carries floating point rounding.
    pub fn sum(&self) -> f64 {
        self.mean * self.count
    }

    /// The fixed quantile levels, in output order.
    fn levels(&self) -> [(&'static str, f64); 8] {
        [
            ("0.01", self.p1),
            ("0.1", self.p10),
            ("0.25", self.p25),
            ("0.5", self.median),
            ("0.75", self.p75),
            ("0.9", self.p90),
            ("0.95", self.p95),
            ("0.99", self.p99),
        ]
    }
}

/// Accumulates summary blocks for one scrape.
///
/// Samples are grouped per family, so blocks for the same name stay
/// contiguous in the output even when records arrive interleaved. Families
/// are emitted in first-seen order.
#[derive(Debug, Default)]
pub struct SummaryRenderer {
    // header and samples, one entry per family
    families: Vec<String>,
    index: HashMap<String, usize>,
    blocks: usize,
}

impl SummaryRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn family(&mut self, name: &str, help: &str) -> &mut String {
        let families = &mut self.families;
        let at = *self.index.entry(name.to_string()).or_insert_with(|| {
            let mut text = String::new();
            let _ = writeln!(text, "# HELP {name} {} {SUM_NOTE}", escape_help(help));
            let _ = writeln!(text, "# TYPE {name} summary");
            families.push(text);
            families.len() - 1
        });
        &mut families[at]
    }

    /// Append one summary block. `labels` keep their given order.
    ///
    /// The `# HELP`/`# TYPE` header is written the first time a name is seen in
    /// this scrape; later blocks for the same name join that family.
    pub fn render(&mut self, name: &str, help: &str, labels: &[(&str, &str)], summary: &Quantiles) {
        let name = sanitize_name(name);
        let labels = render_labels(labels);
        let out = self.family(&name, help);

        let sep = if labels.is_empty() { "" } else { "," };
        for (level, value) in summary.levels() {
            let _ = writeln!(
                out,
                "{name}{{quantile=\"{level}\"{sep}{labels}}} {}",
                format_value(value)
            );
        }
        let braces = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{labels}}}")
        };
        let _ = writeln!(out, "{name}_sum{braces} {}", format_value(summary.sum()));
        let _ = writeln!(out, "{name}_count{braces} {}", format_value(summary.count));
        self.blocks += 1;
    }

    /// Number of blocks rendered since the last reset.
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn reset(&mut self) {
        self.families.clear();
        self.index.clear();
        self.blocks = 0;
    }

    /// Take the rendered text, leaving the renderer empty.
    pub fn flush(&mut self) -> String {
        let out = self.families.concat();
        self.reset();
        out
    }
}

fn render_labels(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", sanitize_name(k), escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Sample values the way the Prometheus text grammar spells them.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

pub fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Map an arbitrary string onto `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

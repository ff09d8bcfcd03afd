//! End-to-end scrapes against a mocked HarperDB operations API.

use std::sync::Arc;
use std::time::Duration;

use config::{Config, File, FileFormat};
use hyper::{Body, Request, StatusCode};
use serde_json::{json, Value};
use wiremock::{Mock, MockServer, ResponseTemplate};

use harperdb_exporter::client::OperationsClient;
use harperdb_exporter::collector::{Collector, Sources};
use harperdb_exporter::config::Settings;
use harperdb_exporter::metrics::build_registry;
use harperdb_exporter::server::{handle, AppState};
use harperdb_exporter::store::{ExporterSettings, SettingsStore};

struct Harness {
    server: MockServer,
    state: AppState,
    _dir: tempfile::TempDir,
}

/// Matches operations API calls whose JSON body contains `needle`.
fn body_has(needle: &'static str) -> impl Fn(&wiremock::Request) -> bool + Send + Sync {
    move |req| String::from_utf8_lossy(&req.body).contains(needle)
}

async fn mount(server: &MockServer, needle: &'static str, response: ResponseTemplate) {
    Mock::given(body_has(needle))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn mount_upstream(server: &MockServer, system_info: Value, analytics: Value) {
    mount(server, "\"threads\"", ResponseTemplate::new(200).set_body_json(system_info)).await;
    mount(server, "hdb_analytics", ResponseTemplate::new(200).set_body_json(analytics)).await;
    mount(
        server,
        "[\"disk\"]",
        ResponseTemplate::new(200).set_body_json(json!({"disk": {"size": []}})),
    )
    .await;
    mount(
        server,
        "cluster_network",
        ResponseTemplate::new(200).set_body_json(json!({"nodes": []})),
    )
    .await;
}

async fn harness(settings: ExporterSettings) -> Harness {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let toml = format!(
        "harperdb_url = \"{}\"\ncluster_ping_timeout = \"200ms\"\nrequest_timeout = \"5s\"",
        server.uri()
    );
    let cfg = Config::builder()
        .add_source(File::from_str(&toml, FileFormat::Toml))
        .build()
        .unwrap();
    let config = Settings::from_config(cfg).unwrap();

    let store = Arc::new(SettingsStore::open(dir.path().join("settings.json")).unwrap());
    store.replace(settings).unwrap();

    let client = Arc::new(OperationsClient::new(&config).unwrap());
    let (registry, exporter) = build_registry().unwrap();
    let collector = Collector::new(
        registry,
        exporter,
        Sources::from_one(client.clone()),
        store,
        config.aggregate_period,
        config.cluster_ping_timeout,
    );

    Harness {
        server,
        state: AppState {
            collector: Arc::new(collector),
            identity: client,
        },
        _dir: dir,
    }
}

async fn get(state: &AppState, path: &str, auth: Option<&str>) -> (StatusCode, String) {
    let mut req = Request::get(path);
    if let Some(auth) = auth {
        req = req.header("authorization", auth);
    }
    let resp = handle(state.clone(), req.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn empty_window_only_reports_defaults() {
    let h = harness(ExporterSettings::default()).await;
    mount_upstream(
        &h.server,
        json!({"threads": [], "harperdb_processes": {"core": [], "clustering": []}}),
        json!([]),
    )
    .await;

    let body = h.state.collector.scrape().await.unwrap();
    assert!(body.contains("harperdb_process_threads_count 0"));
    assert!(!body.contains("harperdb_table_"));
    assert!(!body.contains("summary"));
    assert!(body.contains("harperdb_exporter_scrapes_total 1"));
}

#[tokio::test]
async fn connection_and_duration_records() {
    let h = harness(ExporterSettings::default()).await;
    mount_upstream(
        &h.server,
        json!({"threads": [{}], "metrics": {"data": {"dog": {"puts": 3}}}}),
        json!([
            {"metric": "connection", "path": "mqtt", "method": "connect", "count": 10, "total": 8},
            {"metric": "duration", "type": "http", "path": "/x", "method": "GET",
             "p1": 1, "p10": 2, "p25": 3, "median": 4, "p75": 5, "p90": 6, "p95": 7, "p99": 50,
             "mean": 10, "count": 100}
        ]),
    )
    .await;

    let body = h.state.collector.scrape().await.unwrap();
    // summary text comes first, registry output after it
    assert!(body.starts_with("# HELP duration"));
    assert!(body.contains("duration_sum{type=\"http\",path=\"/x\",method=\"GET\"} 1000"));
    assert!(body.contains("duration_count{type=\"http\",path=\"/x\",method=\"GET\"} 100"));
    assert!(body.contains("connection{action=\"connect\",protocol=\"mqtt\",type=\"total\"} 10"));
    assert!(body.contains("connection{action=\"connect\",protocol=\"mqtt\",type=\"success\"} 8"));
    assert!(body.contains("connection{action=\"connect\",protocol=\"mqtt\",type=\"failed\"} 2"));
    assert!(body.contains("harperdb_table_puts_total{database=\"data\",table=\"dog\"} 3"));
}

#[tokio::test]
async fn stale_values_do_not_survive_the_next_scrape() {
    let h = harness(ExporterSettings::default()).await;
    mount_upstream(
        &h.server,
        json!({"threads": [{}, {}]}),
        json!([{"metric": "cache-hit", "path": "dog", "count": 5, "total": 4}]),
    )
    .await;
    let first = h.state.collector.scrape().await.unwrap();
    assert!(first.contains("cache_hit{table=\"dog\"} 4"));

    h.server.reset().await;
    mount_upstream(&h.server, json!({"threads": []}), json!([])).await;
    let second = h.state.collector.scrape().await.unwrap();
    assert!(!second.contains("cache_hit{table=\"dog\"}"));
    assert!(second.contains("harperdb_process_threads_count 0"));
}

#[tokio::test]
async fn slow_cluster_ping_is_left_out() {
    let h = harness(ExporterSettings::default()).await;
    mount(&h.server, "\"threads\"", ResponseTemplate::new(200).set_body_json(json!({"threads": []}))).await;
    mount(&h.server, "hdb_analytics", ResponseTemplate::new(200).set_body_json(json!([]))).await;
    mount(&h.server, "[\"disk\"]", ResponseTemplate::new(200).set_body_json(json!({}))).await;
    mount(
        &h.server,
        "cluster_network",
        ResponseTemplate::new(200)
            .set_body_json(json!({"nodes": [{"name": "far", "response_time": 5}]}))
            .set_delay(Duration::from_secs(3)),
    )
    .await;

    let body = h.state.collector.scrape().await.unwrap();
    assert!(!body.contains("harperdb_cluster_ping_ms"));
    assert!(body.contains("harperdb_process_threads_count 0"));
}

#[tokio::test]
async fn upstream_failure_is_a_bad_gateway() {
    let h = harness(ExporterSettings::default()).await;
    mount(&h.server, "\"threads\"", ResponseTemplate::new(500).set_body_string("down")).await;
    mount(&h.server, "hdb_analytics", ResponseTemplate::new(200).set_body_json(json!([]))).await;
    mount(&h.server, "[\"disk\"]", ResponseTemplate::new(200).set_body_json(json!({}))).await;
    mount(&h.server, "cluster_network", ResponseTemplate::new(200).set_body_json(json!({}))).await;

    let (status, body) = get(&h.state, "/metrics", None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("down"));
}

#[tokio::test]
async fn forced_authorization_checks_the_caller() {
    let h = harness(ExporterSettings {
        force_authorization: true,
        allowed_users: vec!["grafana".into()],
        ..Default::default()
    })
    .await;
    mount_upstream(&h.server, json!({"threads": []}), json!([])).await;
    mount(
        &h.server,
        "user_info",
        ResponseTemplate::new(200).set_body_json(json!({"username": "grafana", "role": {"permission": {}}})),
    )
    .await;

    let (status, _) = get(&h.state, "/metrics", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = get(&h.state, "/metrics", Some("Basic Z3JhZmFuYTpwdw==")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("harperdb_process_threads_count"));

    // listed, but not a super user
    let (status, _) = get(&h.state, "/settings", Some("Basic Z3JhZmFuYTpwdw==")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn custom_rules_can_be_installed_over_http() {
    let h = harness(ExporterSettings::default()).await;
    mount_upstream(
        &h.server,
        json!({"threads": []}),
        json!([{"metric": "custom1", "path": "orders", "p1": 0, "mean": 1, "count": 2}]),
    )
    .await;
    mount(
        &h.server,
        "user_info",
        ResponseTemplate::new(200)
            .set_body_json(json!({"username": "admin", "role": {"permission": {"super_user": true}}})),
    )
    .await;

    let clash = json!({
        "customMetrics": [{
            "name": "harperdb_exporter_scrapes_total",
            "metricAttribute": "metric",
            "labels": [{"label": "quantile", "metricAttribute": "path"}]
        }]
    });
    let req = Request::put("/settings")
        .header("authorization", "Basic YWRtaW46cHc=")
        .body(Body::from(clash.to_string()))
        .unwrap();
    let resp = handle(h.state.clone(), req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let rules = json!({
        "customMetrics": [{
            "name": "custom1",
            "metricAttribute": "metric",
            "help": "Orders latency",
            "labels": [{"label": "tbl", "metricAttribute": "path"}]
        }]
    });
    let req = Request::put("/settings")
        .header("authorization", "Basic YWRtaW46cHc=")
        .body(Body::from(rules.to_string()))
        .unwrap();
    let resp = handle(h.state.clone(), req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let (status, body) = get(&h.state, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("# TYPE custom1 summary"));
    assert!(body.contains("custom1{quantile=\"0.01\",tbl=\"orders\"} 0"));
    assert!(body.contains("custom1_count{tbl=\"orders\"} 2"));
}

#[tokio::test]
async fn scrapers_offering_openmetrics_get_classic_text() {
    let h = harness(ExporterSettings::default()).await;
    mount_upstream(
        &h.server,
        json!({"threads": []}),
        json!([{"metric": "duration", "type": "http", "path": "/x", "method": "GET", "count": 1}]),
    )
    .await;

    // Prometheus' default scrape header
    let req = Request::get("/metrics")
        .header(
            "accept",
            "application/openmetrics-text;version=1.0.0;q=0.5,text/plain;version=0.0.4;q=0.4,*/*;q=0.1",
        )
        .body(Body::empty())
        .unwrap();
    let resp = handle(h.state.clone(), req).await.unwrap();
    assert_eq!(
        resp.headers()["content-type"],
        "text/plain; version=0.0.4; charset=utf-8"
    );
    let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    let body = String::from_utf8_lossy(&bytes);
    assert!(!body.contains("# EOF"));
    assert!(!body.contains("\n\n"), "no blank line between summaries and registry output");
    assert!(body.contains("duration_count{type=\"http\",path=\"/x\",method=\"GET\"} 1\n# HELP"));

    let (status, _) = get(&h.state, "/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = get(&h.state, "/healthz", None).await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "OK"));
}

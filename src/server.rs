//! Embedded HTTP server: `/metrics`, `/healthz` and `/settings`.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tracing::{error, info, warn};

use crate::collector::Collector;
use crate::errors::ExporterError;
use crate::sources::{Caller, IdentitySource};
use crate::store::{authorize, Access, ExporterSettings};

/// Classic text exposition, served whatever the scraper lists in `Accept`.
/// Prometheus (v3+) rejects a scrape without the version parameter.
pub const CLASSIC_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared by every connection.
#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<Collector>,
    pub identity: Arc<dyn IdentitySource>,
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    let mut resp = Response::new(body.into());
    *resp.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        resp.headers_mut().insert(CONTENT_TYPE, value);
    }
    resp
}

fn text(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    respond(status, "text/plain; charset=utf-8", body)
}

fn upstream_failure(e: &ExporterError) -> Response<Body> {
    let status = if e.is_upstream() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    text(status, e.to_string())
}

fn header(req: &Request<Body>, name: hyper::header::HeaderName) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Resolve the caller from `Authorization`, if any was sent.
async fn caller(state: &AppState, authorization: Option<&str>) -> Result<Option<Caller>, ExporterError> {
    match authorization {
        Some(header) => state.identity.identify(header).await,
        None => Ok(None),
    }
}

async fn metrics(state: &AppState, authorization: Option<String>) -> Response<Body> {
    let settings = state.collector.settings().snapshot();
    if settings.force_authorization {
        let who = match caller(state, authorization.as_deref()).await {
            Ok(who) => who,
            Err(e) => return upstream_failure(&e),
        };
        if authorize(&settings, who.as_ref()) == Access::Forbidden {
            return text(StatusCode::FORBIDDEN, "Forbidden");
        }
    }

    match state.collector.scrape().await {
        Ok(body) => respond(StatusCode::OK, CLASSIC_TYPE, body),
        Err(e) => {
            error!(error = %e, "Failed to serve /metrics");
            upstream_failure(&e)
        }
    }
}

async fn settings(state: &AppState, req: Request<Body>) -> Response<Body> {
    let authorization = header(&req, AUTHORIZATION);
    match caller(state, authorization.as_deref()).await {
        Ok(Some(c)) if c.super_user => {}
        Ok(_) => return text(StatusCode::FORBIDDEN, "Forbidden"),
        Err(e) => return upstream_failure(&e),
    }

    let store = state.collector.settings();
    if req.method() == Method::GET {
        return match serde_json::to_string_pretty(&*store.snapshot()) {
            Ok(json) => respond(StatusCode::OK, "application/json", json),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
    }

    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(e) => return text(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let next: ExporterSettings = match serde_json::from_slice(&bytes) {
        Ok(next) => next,
        Err(e) => return text(StatusCode::BAD_REQUEST, e.to_string()),
    };
    if let Err(reason) = state.collector.validate_settings(&next) {
        return text(StatusCode::BAD_REQUEST, reason);
    }
    match store.replace(next) {
        Ok(()) => text(StatusCode::OK, "OK"),
        Err(e) => {
            error!(error = %e, "Failed to persist exporter settings");
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Route one request.
pub async fn handle(state: AppState, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => metrics(&state, header(&req, AUTHORIZATION)).await,
        (&Method::GET, "/healthz") => text(StatusCode::OK, "OK"),
        (&Method::GET, "/settings") | (&Method::PUT, "/settings") => settings(&state, req).await,
        _ => {
            warn!(method = %req.method(), path = %req.uri().path(), "No route");
            text(StatusCode::NOT_FOUND, Body::empty())
        }
    };
    Ok(resp)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ExporterError> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| handle(state.clone(), req)))
        }
    });

    info!(%addr, "Starting metrics server");
    Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

//! Provides helper functions for initializing telemetry collection and publication.
use std::{convert::Infallible, net::SocketAddr};

use anyhow::Result;
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::MeterProvider, runtime, trace, Resource};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

/// Format of the log lines written to stdout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable single line output
    #[default]
    Compact,
    /// One JSON object per line
    Json,
}

fn resource(service_name: &'static str) -> Resource {
    Resource::new(vec![
        KeyValue::new(
            "hostname",
            gethostname::gethostname()
                .into_string()
                .unwrap_or_else(|_| "unknown".to_owned()),
        ),
        KeyValue::new("service.name", service_name),
    ])
}

/// Initialize logging and, when an OTLP endpoint is given, span export.
pub fn init_tracing(
    service_name: &'static str,
    otlp_endpoint: Option<String>,
    format: LogFormat,
) -> Result<()> {
    let tracer = match otlp_endpoint {
        Some(endpoint) => Some(
            opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(trace::config().with_resource(resource(service_name)))
                .install_batch(runtime::Tokio)?,
        ),
        None => None,
    };

    // Setup filters
    // Default to INFO if no env is specified
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let otlp_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    // Setup tracing layers
    let telemetry = tracer.map(|tracer| {
        tracing_opentelemetry::layer()
            .with_tracer(tracer)
            .with_filter(otlp_filter)
    });
    let logger = match format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .compact()
            .with_filter(log_filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(log_filter)
            .boxed(),
    };

    let collector = tracing_subscriber::Registry::default()
        .with(telemetry)
        .with(logger);

    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}

/// Install a global meter provider that records into the returned Prometheus registry.
pub fn init_metrics(service_name: &'static str) -> Result<(MeterProvider, Registry)> {
    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_resource(resource(service_name))
        .build();
    opentelemetry::global::set_meter_provider(provider.clone());
    Ok((provider, registry))
}

/// Flush pending spans and metrics.
pub fn shutdown(provider: MeterProvider) {
    opentelemetry::global::shutdown_tracer_provider();
    if let Err(err) = provider.shutdown() {
        warn!(%err, "failed to shutdown meter provider");
    }
}

/// Serve the contents of the registry on `GET /metrics` until the server fails.
pub async fn serve_metrics(addr: SocketAddr, registry: Registry) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_metrics(req, registry.clone())
            }))
        }
    });
    info!(%addr, "serving metrics");
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

async fn handle_metrics(
    req: Request<Body>,
    registry: Registry,
) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(resp);
    }

    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buf) {
        warn!(%err, "failed to encode metrics");
        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return Ok(resp);
    }
    let mut resp = Response::new(Body::from(buf));
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        resp.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    Ok(resp)
}

//! Logging and optional OTLP trace export.
//!
//! Export is enabled by `OTEL_EXPORTER_OTLP_ENDPOINT` (gRPC only). Extra exporter
//! metadata comes from `OTEL_EXPORTER_OTLP_HEADERS` as `key=value,key=value`; keys
//! ending in `-bin` carry base64 values.

use anyhow::{Context, Result, anyhow};
use base64::{Engine, engine::general_purpose};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, propagation::TextMapCompositePropagator, trace::TracerProvider as _};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer},
};
use std::{env::var, time::Duration};
use tonic::{
    metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};
use ulid::Ulid;

const ENV_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const ENV_HEADERS: &str = "OTEL_EXPORTER_OTLP_HEADERS";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

/// Split `key=value` pairs; pairs without `=` are dropped.
fn parse_header_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}

fn metadata_from_pairs(pairs: &[(String, String)]) -> Result<MetadataMap> {
    let mut metadata = MetadataMap::with_capacity(pairs.len());
    for (key, value) in pairs {
        if key.ends_with("-bin") {
            let bytes = general_purpose::STANDARD
                .decode(value.as_bytes())
                .with_context(|| format!("metadata {key} is not valid base64"))?;
            let key = MetadataKey::<Binary>::from_bytes(key.as_bytes())
                .map_err(|err| anyhow!("invalid metadata key {key}: {err}"))?;
            metadata.insert_bin(key, MetadataValue::from_bytes(&bytes));
        } else {
            let name = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
                .map_err(|err| anyhow!("invalid metadata key {key}: {err}"))?;
            let value: MetadataValue<Ascii> = value
                .parse()
                .map_err(|err| anyhow!("invalid metadata value for {key}: {err}"))?;
            metadata.insert(name, value);
        }
    }
    Ok(metadata)
}

/// Endpoints without a scheme are assumed to be TLS.
fn exporter_endpoint(raw: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{}", raw.trim_end_matches('/'))
    }
}

fn tls_domain(endpoint: &str) -> Option<&str> {
    endpoint
        .strip_prefix("https://")?
        .split(['/', ':'])
        .next()
        .filter(|host| !host.is_empty())
}

fn init_tracer(raw_endpoint: &str) -> Result<Tracer> {
    let endpoint = exporter_endpoint(raw_endpoint);

    let mut exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_compression(Compression::Gzip)
        .with_timeout(EXPORT_TIMEOUT);

    if let Some(domain) = tls_domain(&endpoint) {
        exporter = exporter.with_tls_config(
            ClientTlsConfig::new()
                .domain_name(domain.to_string())
                .with_native_roots(),
        );
    }

    let pairs = var(ENV_HEADERS)
        .map(|raw| parse_header_pairs(&raw))
        .unwrap_or_default();
    if !pairs.is_empty() {
        exporter = exporter.with_metadata(metadata_from_pairs(&pairs)?);
    }

    let instance_id = var("OTEL_SERVICE_INSTANCE_ID").unwrap_or_else(|_| Ulid::new().to_string());
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter.build()?)
        .with_resource(
            Resource::builder_empty()
                .with_attributes([
                    KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    KeyValue::new("service.instance.id", instance_id),
                ])
                .build(),
        )
        .build();

    let _ = TRACER_PROVIDER.set(provider.clone());
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    Ok(provider.tracer(env!("CARGO_PKG_NAME")))
}

/// Install the global subscriber. `RUST_LOG` overrides the verbosity level.
///
/// # Errors
///
/// Returns an error if the exporter or subscriber cannot be initialized
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_target(false);

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity_level.unwrap_or(Level::ERROR).into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("tokio=error".parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?);

    let registry = Registry::default().with(fmt_layer).with(filter);
    match var(ENV_ENDPOINT) {
        Ok(endpoint) if !endpoint.trim().is_empty() => {
            let tracer = init_tracer(endpoint.trim())?;
            tracing::subscriber::set_global_default(
                registry.with(tracing_opentelemetry::layer().with_tracer(tracer)),
            )?;
        }
        _ => tracing::subscriber::set_global_default(registry)?,
    }

    Ok(())
}

/// Flush pending spans. Noop when export was never enabled.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("shutting down tracer provider");
        if let Err(err) = provider.shutdown() {
            debug!("tracer provider shutdown failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_pairs_skip_malformed_entries() {
        let pairs = parse_header_pairs("Authorization = Bearer abc ,malformed,x-team=edge,=empty");
        assert_eq!(
            pairs,
            vec![
                ("authorization".to_string(), "Bearer abc".to_string()),
                ("x-team".to_string(), "edge".to_string()),
            ]
        );
        assert!(parse_header_pairs("").is_empty());
    }

    #[test]
    fn metadata_accepts_ascii_and_binary_keys() -> Result<()> {
        let metadata = metadata_from_pairs(&[
            ("authorization".to_string(), "Bearer abc".to_string()),
            ("trace-bin".to_string(), "YmluYXJ5".to_string()),
        ])?;
        assert_eq!(metadata.len(), 2);
        Ok(())
    }

    #[test]
    fn metadata_rejects_bad_base64() {
        let result = metadata_from_pairs(&[("trace-bin".to_string(), "%%%".to_string())]);
        assert!(result.is_err_and(|err| err.to_string().contains("base64")));
    }

    #[test]
    fn endpoint_defaults_to_tls() {
        assert_eq!(exporter_endpoint("http://localhost:4317"), "http://localhost:4317");
        assert_eq!(exporter_endpoint("otel.example.com:4317/"), "https://otel.example.com:4317");
        assert_eq!(tls_domain("https://otel.example.com:4317/v1"), Some("otel.example.com"));
        assert_eq!(tls_domain("http://localhost:4317"), None);
    }

    #[test]
    fn shutdown_without_provider_is_noop() {
        shutdown_tracer();
    }
}

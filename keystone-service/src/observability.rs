//! Tracing and telemetry
//!
//! Log output is JSON via `tracing-subscriber` with an `EnvFilter` seeded
//! from configuration. OTLP export (traces + metrics) is strictly
//! best-effort: the exporter is attempted a bounded number of times with
//! backoff, failures are logged, and the service runs on without telemetry.
//! A sidecar health probe, when configured, runs the same way in the
//! background.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, TelemetryConfig, TelemetryProtocol};
use crate::error::Result;

/// Initialize tracing, with OTLP layered in when telemetry is configured
/// and reachable.
///
/// Never fails startup: exporter construction errors degrade to local-only
/// logging.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.service.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().json();

    let tracer = config
        .telemetry
        .as_ref()
        .and_then(|telemetry| build_tracer(&config.service.name, telemetry));

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);
    let init_result = match tracer {
        Some(tracer) => registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init(),
        None => registry.try_init(),
    };
    // A second init in the same process (tests) is fine; keep the first.
    if init_result.is_err() {
        tracing::debug!("tracing subscriber was already initialized");
    }

    tracing::info!(service = %config.service.name, "tracing initialized");
    Ok(())
}

/// Build the OTLP tracer with bounded retries; also installs the metric
/// provider when the exporter comes up.
fn build_tracer(
    service_name: &str,
    telemetry: &TelemetryConfig,
) -> Option<opentelemetry_sdk::trace::Tracer> {
    if telemetry.protocol == TelemetryProtocol::Console {
        tracing::info!("telemetry protocol=console: spans stay in local logs");
        return None;
    }

    let mut delay = Duration::from_millis(250);
    for attempt in 1..=telemetry.max_attempts.max(1) {
        match try_build_providers(service_name, telemetry) {
            Ok(tracer) => return Some(tracer),
            Err(e) => {
                tracing::warn!(
                    attempt,
                    max_attempts = telemetry.max_attempts,
                    "OTLP exporter setup failed: {e}"
                );
                if attempt < telemetry.max_attempts {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
    }
    tracing::warn!("continuing without telemetry export");
    None
}

fn try_build_providers(
    service_name: &str,
    telemetry: &TelemetryConfig,
) -> std::result::Result<opentelemetry_sdk::trace::Tracer, String> {
    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    let span_exporter = match telemetry.protocol {
        TelemetryProtocol::Grpc | TelemetryProtocol::Grpcs => {
            opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(&telemetry.otlp_endpoint)
                .build()
        }
        TelemetryProtocol::Http | TelemetryProtocol::Https => {
            opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_endpoint(&telemetry.otlp_endpoint)
                .build()
        }
        TelemetryProtocol::Console => unreachable!("console handled by the caller"),
    }
    .map_err(|e| e.to_string())?;

    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .with_resource(resource.clone())
        .build();
    let tracer = tracer_provider.tracer("keystone-service");
    opentelemetry::global::set_tracer_provider(tracer_provider);

    let metric_exporter = match telemetry.protocol {
        TelemetryProtocol::Grpc | TelemetryProtocol::Grpcs => {
            opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_endpoint(&telemetry.otlp_endpoint)
                .build()
        }
        _ => opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_endpoint(&telemetry.otlp_endpoint)
            .build(),
    }
    .map_err(|e| e.to_string())?;
    let meter_provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(resource)
        .build();
    opentelemetry::global::set_meter_provider(meter_provider);

    Ok(tracer)
}

/// Spawn the sidecar health probe, if configured.
///
/// Bounded attempts with backoff; an unreachable sidecar is logged and then
/// left alone.
pub fn spawn_sidecar_probe(config: &Config, cancel: &CancellationToken) {
    let Some(telemetry) = config.telemetry.clone() else {
        return;
    };
    let Some(url) = telemetry.sidecar_health_url.clone() else {
        return;
    };
    let cancel = cancel.clone();

    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("sidecar probe client failed to build: {e}");
                return;
            }
        };

        let mut delay = Duration::from_millis(500);
        for attempt in 1..=telemetry.max_attempts.max(1) {
            tokio::select! {
                _ = cancel.cancelled() => return,
                response = client.get(&url).send() => match response {
                    Ok(response) if response.status().is_success() => {
                        tracing::info!(%url, "telemetry sidecar is healthy");
                        return;
                    }
                    Ok(response) => {
                        tracing::warn!(
                            attempt,
                            status = %response.status(),
                            "telemetry sidecar probe unhealthy"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(attempt, "telemetry sidecar probe failed: {e}");
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay *= 2;
        }
        tracing::warn!(%url, "giving up on the telemetry sidecar");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_without_telemetry_succeeds() {
        let config = Config::default();
        init_tracing(&config).unwrap();
        // Idempotent across tests in one process.
        init_tracing(&config).unwrap();
    }

    #[test]
    fn console_protocol_skips_export() {
        let mut config = Config::default();
        config.telemetry = Some(TelemetryConfig {
            otlp_endpoint: "http://127.0.0.1:4317".to_string(),
            protocol: TelemetryProtocol::Console,
            sidecar_health_url: None,
            max_attempts: 1,
        });
        init_tracing(&config).unwrap();
    }
}

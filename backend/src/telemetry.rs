//! Telemetry initialization: tracing subscriber with optional OpenTelemetry export.
//!
//! When `OTEL_EXPORTER_OTLP_ENDPOINT` is set, an OTLP span exporter is added
//! next to the stderr fmt layer so long-running `daemon` processes can ship
//! backup spans.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "backup_keeper=info,sqlx::query=warn";
const VERBOSE_FILTER: &str = "backup_keeper=debug,sqlx::query=info";

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over `verbose`. Returns a guard that must be held until
/// exit so pending spans are flushed.
pub fn init_tracing(otel_endpoint: Option<&str>, verbose: bool) -> Option<OtelGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            VERBOSE_FILTER.into()
        } else {
            DEFAULT_FILTER.into()
        }
    });
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match otel_endpoint {
        Some(endpoint) => match build_provider(endpoint) {
            Ok(provider) => {
                use opentelemetry::trace::TracerProvider;

                let tracer = provider.tracer("backup-keeper");
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .init();
                tracing::info!(otel_endpoint = endpoint, "OpenTelemetry tracing enabled");
                Some(OtelGuard { provider })
            }
            Err(e) => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .init();
                tracing::warn!("OTLP exporter unavailable, logging locally only: {}", e);
                None
            }
        },
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
            None
        }
    }
}

/// Shuts down the tracer provider on drop, flushing pending spans.
pub struct OtelGuard {
    provider: opentelemetry_sdk::trace::SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("Failed to shutdown OTel tracer provider: {e:?}");
        }
    }
}

fn build_provider(
    endpoint: &str,
) -> Result<opentelemetry_sdk::trace::SdkTracerProvider, Box<dyn std::error::Error + Send + Sync>> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::{SpanExporter, WithExportConfig};
    use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracerProvider};
    use opentelemetry_sdk::Resource;

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", "backup-keeper"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    Ok(SdkTracerProvider::builder()
        .with_resource(resource)
        .with_span_processor(BatchSpanProcessor::builder(exporter).build())
        .build())
}

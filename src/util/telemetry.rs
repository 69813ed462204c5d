use std::time::Duration;

use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::util::env::Var;
use crate::var;

pub type Result<T> = core::result::Result<T, Box<dyn std::error::Error>>;

const DEFAULT_FILTER: &str =
    "clinic_rewards_server=debug,tower_http=debug,axum=debug,sqlx=info,info";

/// Tracing/telemetry assembly.
///
/// Span export over OTLP is an optional capability: when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is unset the subscriber runs with the fmt
/// layer only, which is what local development and the test harness want.
pub struct Telemetry {
    pub tracer_name: &'static str,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub async fn new() -> Result<Telemetry> {
        let tracer_name = var!(Var::ApiTracerName).await?;
        let service_name = var!(Var::ApiServiceName).await?;
        let service_version = env!("CARGO_PKG_VERSION");

        let tracer_provider = match var!(Var::OtelExporterEndpoint).await {
            Ok(collector_url) => Some(build_tracer_provider(
                collector_url,
                base_attrs(service_name, service_version),
            )?),
            Err(_) => None,
        };

        Ok(Self {
            tracer_name,
            tracer_provider,
        })
    }

    pub fn register(self) -> Self {
        let trace_layer = self.tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(global::tracer(self.tracer_name))
        });

        tracing_subscriber::registry()
            .with(trace_layer)
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .init();

        self
    }

    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("error during tracing shutdown: {e:?}");
            }
        }
    }
}

fn build_tracer_provider(collector_url: &str, base_resource: Resource) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(format!("{collector_url}/v1/traces"))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

fn base_attrs(name: &'static str, version: &'static str) -> Resource {
    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", name),
            KeyValue::new("service.version", version),
        ])
        .build()
}

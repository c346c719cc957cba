//! Tracing subscriber setup for binaries embedding the bus.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the log filter directive.
pub const LOG_ENV_VAR: &str = "JETBUS_LOG";

/// Initialize tracing with an `EnvFilter` from `JETBUS_LOG` (default `info`).
///
/// Spans carry OpenTelemetry contexts so published envelopes embed valid
/// trace metadata. The tracer provider is registered globally; exporters are
/// left to the embedding service.
pub fn init_tracing() {
    let provider = TracerProvider::builder().build();
    let tracer = provider.tracer("jetbus");
    opentelemetry::global::set_tracer_provider(provider);
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();
}

//! Logging subscriber setup (SPEC_FULL.md §1.1), mirroring the teacher's
//! `telemetry.rs` but scaled down to this crate's ambient needs: `tracing`
//! to stdout via `RUST_LOG`, with an optional OpenTelemetry layer behind the
//! `telemetry` feature rather than the teacher's always-on OTLP exporter —
//! this crate has no metrics/exporter infrastructure of its own to feed, so
//! the full stack would be dead weight (noted in DESIGN.md).

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global `tracing` subscriber. Call once at process startup.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(not(feature = "telemetry"))]
    {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }

    #[cfg(feature = "telemetry")]
    {
        init_with_otel(filter);
    }
}

#[cfg(feature = "telemetry")]
fn init_with_otel(filter: EnvFilter) {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    let provider = SdkTracerProvider::builder().build();
    let tracer = provider.tracer("relayer-core");
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(otel_layer)
        .init();
}

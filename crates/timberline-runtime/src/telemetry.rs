//! Log and span output for the Timberline binaries.
//!
//! [`init_tracing`] installs the global subscriber: an [`EnvFilter`] (from
//! `RUST_LOG`, default `info`), a console formatter chosen by
//! `TIMBERLINE_LOG_FORMAT` (`compact` or `json`) and, when a collector is
//! configured, an OTLP/HTTP span exporter.
//!
//! The collector URL is read from `TIMBERLINE_OTLP_ENDPOINT`, falling back
//! to the standard `OTEL_EXPORTER_OTLP_ENDPOINT`.
//!
//! ```rust,no_run
//! let _guard = timberline_runtime::init_tracing("timberline");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FORMAT_ENV: &str = "TIMBERLINE_LOG_FORMAT";
pub const OTLP_ENDPOINT_ENV: &str = "TIMBERLINE_OTLP_ENDPOINT";
const OTEL_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Console output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    /// Unknown values fall back to [`LogFormat::Compact`].
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }

    fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV).map(|v| Self::parse(&v)).unwrap_or_default()
    }

    fn layer<S>(self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        match self {
            LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
            LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        }
    }
}

/// Install the global subscriber.  Hold the returned guard until exit so
/// buffered spans reach the collector.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let provider = otlp_endpoint().and_then(|endpoint| span_provider(service_name, endpoint));
    let spans = provider.as_ref().map(|p| {
        tracing_opentelemetry::layer()
            .with_tracer(p.tracer(service_name.to_string()))
            .boxed()
    });

    Registry::default()
        .with(filter)
        .with(spans)
        .with(LogFormat::from_env().layer())
        .init();

    TracerProviderGuard(provider)
}

/// Shuts the span provider down on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[timberline] span exporter shutdown failed: {e}");
        }
    }
}

fn otlp_endpoint() -> Option<String> {
    pick_endpoint(
        std::env::var(OTLP_ENDPOINT_ENV).ok(),
        std::env::var(OTEL_ENDPOINT_ENV).ok(),
    )
}

fn pick_endpoint(own: Option<String>, standard: Option<String>) -> Option<String> {
    [own, standard]
        .into_iter()
        .flatten()
        .map(|url| url.trim().to_string())
        .find(|url| !url.is_empty())
}

fn span_provider(service_name: &str, endpoint: String) -> Option<SdkTracerProvider> {
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("[timberline] OTLP exporter unavailable, console only: {e}");
            return None;
        }
    };

    // Simple exporter: the CLI starts its Tokio runtime after this runs.
    Some(
        SdkTracerProvider::builder()
            .with_resource(Resource::builder().with_service_name(service_name.to_string()).build())
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_json_case_insensitively() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Compact);
        assert_eq!(LogFormat::parse(""), LogFormat::Compact);
    }

    #[test]
    fn own_endpoint_wins_over_standard() {
        let picked = pick_endpoint(Some("http://a:4318".into()), Some("http://b:4318".into()));
        assert_eq!(picked.as_deref(), Some("http://a:4318"));
    }

    #[test]
    fn blank_endpoint_is_ignored() {
        assert_eq!(
            pick_endpoint(Some("  ".into()), Some("http://b:4318".into())).as_deref(),
            Some("http://b:4318")
        );
        assert_eq!(pick_endpoint(None, None), None);
    }

    #[test]
    fn empty_guard_drops_cleanly() {
        drop(TracerProviderGuard(None));
    }
}

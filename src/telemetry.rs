//! Tracing subscriber setup and the error-reporting contract.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tracing::error;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the global subscriber once; later calls are no-ops.
///
/// `RUST_LOG` wins over the configured level. sqlx logs through `log`, so the
/// `log` bridge goes in first.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    install_log_bridge()?;

    let result = tracing_subscriber::registry()
        .with(env_filter(&config.log_level))
        .with(output_layer(&config.log_format))
        .try_init();
    if result.is_err() {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
    }
    Ok(result?)
}

fn install_log_bridge() -> Result<(), TelemetryInitError> {
    match LogTracer::builder().with_max_level(LevelFilter::Trace).init() {
        Ok(()) => Ok(()),
        // Test binaries may have installed the bridge already.
        Err(_) if type_name_of_val(log::logger()).contains("LogTracer") => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn output_layer<S>(format: &str) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    match format {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().flatten_event(true).boxed(),
    }
}

/// Sink for failures that should reach an error-reporting service.
pub trait ErrorNotifier: Send + Sync {
    fn notify(&self, error: &(dyn std::error::Error + 'static), context: Value);
}

/// Reports errors as structured `error!` events and counts them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl ErrorNotifier for TracingNotifier {
    fn notify(&self, err: &(dyn std::error::Error + 'static), context: Value) {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        counter!("pipes_errors_reported_total").increment(1);
        error!(error = %err, causes = ?chain, context = %context, "Reported error");
    }
}

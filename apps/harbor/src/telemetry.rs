use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Process-wide logging and metrics.
///
/// Logging honours `RUST_LOG` and falls back to `info`. The Prometheus
/// recorder is only installed for the coordinator; the boat and probe clients
/// only need logs.
pub struct Telemetry {
    metrics_handle: Option<PrometheusHandle>,
}

impl Telemetry {
    pub fn init(with_metrics: bool) -> Result<Self> {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        let metrics_handle = if with_metrics {
            Some(
                PrometheusBuilder::new()
                    .install_recorder()
                    .context("failed to install Prometheus metrics recorder")?,
            )
        } else {
            None
        };

        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> Option<PrometheusHandle> {
        self.metrics_handle.clone()
    }
}

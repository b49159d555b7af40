//! Telemetry seam. The transport is provided by the embedding agent; when
//! none is configured, [`LogMetricsClient`] writes metrics to the log.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metrics transport error: {0}")]
    Transport(String),
}

pub trait MetricsClient: Send + Sync + 'static {
    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), MetricsError>;
    fn gauge(&self, name: &str, value: f64, tags: &[String]) -> Result<(), MetricsError>;
}

#[derive(Debug, Default, Clone)]
pub struct LogMetricsClient;

impl MetricsClient for LogMetricsClient {
    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), MetricsError> {
        log::info!(target: "metrics", "count {name}={value} [{}]", tags.join(","));
        Ok(())
    }

    fn gauge(&self, name: &str, value: f64, tags: &[String]) -> Result<(), MetricsError> {
        log::info!(target: "metrics", "gauge {name}={value} [{}]", tags.join(","));
        Ok(())
    }
}

//! Gateway shared state.

use std::sync::Arc;

use vistalk_core::WireFormat;
use vistalk_core::config::Config;
use vistalk_pipeline::PipelineContext;

/// Shared state handed to every handler.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub pipeline: Arc<PipelineContext>,
    /// Default framing for streaming responses.
    pub wire_format: WireFormat,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, pipeline: Arc<PipelineContext>) -> Self {
        let wire_format = config.wire_format();
        Self {
            config,
            pipeline,
            wire_format,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

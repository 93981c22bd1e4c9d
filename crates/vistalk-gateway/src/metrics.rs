//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use vistalk_pipeline::{RunOutcome, RunSummary};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Record an HTTP request with its duration.
pub fn record_request(route: &str, duration_secs: f64) {
    let labels = [("route", route.to_string())];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_request_duration_seconds", &labels).record(duration_secs);
}

/// Record a finished pipeline run: stage durations and how it ended.
pub fn record_run(summary: &RunSummary) {
    for (stage, spent) in &summary.stage_timings {
        let labels = [("stage", stage.as_str().to_string())];
        metrics::histogram!("pipeline_stage_duration_seconds", &labels)
            .record(spent.as_secs_f64());
    }
    let outcome = match summary.outcome {
        RunOutcome::Done => "done",
        RunOutcome::Failed(kind) => {
            record_error(kind.as_str());
            "error"
        }
        RunOutcome::Disconnected => "disconnected",
    };
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("pipeline_runs_total", &labels).increment(1);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}

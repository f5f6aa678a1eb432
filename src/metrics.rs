use tracing::trace;

// Trace-based counters; the Prometheus recorder in `main` renders whatever the
// exporter has collected.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "studio.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "studio.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn stage_failed(stage: &'static str, kind: &'static str) {
    trace!(
        target = "studio.metrics",
        stage = stage,
        kind = kind,
        "stage_failed_inc"
    );
}

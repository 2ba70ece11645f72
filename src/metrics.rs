// Prometheus metrics definitions for the arena backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Battles currently streaming to a client.
    pub static ref ACTIVE_BATTLES: IntGauge =
        IntGauge::new("arena_active_battles", "Battles currently in flight").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Total battles started.
    pub static ref BATTLES_STARTED_TOTAL: IntCounter =
        IntCounter::new("arena_battles_started_total", "Total battles started").unwrap();

    /// Total battles that completed through the winner stage.
    pub static ref BATTLES_COMPLETED_TOTAL: IntCounter =
        IntCounter::new("arena_battles_completed_total", "Total battles completed").unwrap();

    /// Total battles aborted by an upstream completion failure.
    pub static ref BATTLES_ERRORED_TOTAL: IntCounter =
        IntCounter::new("arena_battles_errored_total", "Total battles that errored").unwrap();

    /// Total admission checks denied by the rate limiter, by tier.
    pub static ref ADMISSIONS_DENIED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_admissions_denied_total", "Admission checks denied"),
        &["tier"],
    )
    .unwrap();

    /// Total completion API calls, by model class.
    pub static ref COMPLETION_CALLS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_completion_calls_total", "Completion API calls"),
        &["model_class"],
    )
    .unwrap();

    /// Total critique/judgment payloads that failed to parse and were
    /// replaced with the sentinel fallback.
    pub static ref PARSE_FALLBACKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("arena_parse_fallbacks_total", "Model JSON parse fallbacks"),
        &["stage"],
    )
    .unwrap();

    /// Total stage events written to client streams.
    pub static ref STAGE_EVENTS_SENT_TOTAL: IntCounter = IntCounter::new(
        "arena_stage_events_sent_total",
        "Stage events written to client streams",
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Wall-clock duration of a full battle pipeline.
    pub static ref BATTLE_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("arena_battle_duration_seconds", "Battle pipeline duration")
            .buckets(vec![1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 45.0, 60.0]),
    )
    .unwrap();
}

/// Register all metrics with the registry. Call once at startup.
pub fn register_metrics() {
    REGISTRY.register(Box::new(ACTIVE_BATTLES.clone())).ok();
    REGISTRY
        .register(Box::new(BATTLES_STARTED_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(BATTLES_COMPLETED_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(BATTLES_ERRORED_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(ADMISSIONS_DENIED_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(COMPLETION_CALLS_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(PARSE_FALLBACKS_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(STAGE_EVENTS_SENT_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(BATTLE_DURATION_SECONDS.clone()))
        .ok();
}

/// Render all registered metrics in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_metrics() {
        register_metrics();
        BATTLES_STARTED_TOTAL.inc();
        let output = render();
        assert!(output.contains("arena_battles_started_total"));
    }
}

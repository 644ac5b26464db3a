use std::sync::OnceLock;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static REQUESTS_IN_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static AUTH_FAILURES_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static THROTTLED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CACHE_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CALLS_IN_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CALL_TIMEOUTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static COMMAND_TIMEOUTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static ZOMBIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HALTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static EXPIRED_RESULTS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static PENDING_REQUESTS: OnceLock<IntGauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn requests_in_total() -> &'static IntCounter {
    REQUESTS_IN_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new("bolt_engine_requests_in_total", "HTTP requests received.")
                .expect("create bolt_engine_requests_in_total"),
        )
    })
}

fn auth_failures_total() -> &'static IntCounter {
    AUTH_FAILURES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "bolt_engine_auth_failures_total",
                "Requests rejected by the authentication gate.",
            )
            .expect("create bolt_engine_auth_failures_total"),
        )
    })
}

fn throttled_total() -> &'static IntCounterVec {
    THROTTLED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "bolt_engine_throttled_total",
                    "Requests rejected by the per-group rate limit.",
                ),
                &["group"],
            )
            .expect("create bolt_engine_throttled_total"),
        )
    })
}

fn cache_events_total() -> &'static IntCounterVec {
    CACHE_EVENTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "bolt_engine_cache_events_total",
                    "Result cache hits, misses, and header overrides.",
                ),
                &["event"],
            )
            .expect("create bolt_engine_cache_events_total"),
        )
    })
}

fn calls_in_total() -> &'static IntCounterVec {
    CALLS_IN_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("bolt_engine_calls_in_total", "API calls admitted."),
                &["call"],
            )
            .expect("create bolt_engine_calls_in_total"),
        )
    })
}

fn call_timeouts_total() -> &'static IntCounterVec {
    CALL_TIMEOUTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "bolt_engine_call_timeouts_total",
                    "Per-call overall timeouts observed.",
                ),
                &["call"],
            )
            .expect("create bolt_engine_call_timeouts_total"),
        )
    })
}

fn command_timeouts_total() -> &'static IntCounterVec {
    COMMAND_TIMEOUTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "bolt_engine_command_timeouts_total",
                    "Per-command timeouts observed.",
                ),
                &["command"],
            )
            .expect("create bolt_engine_command_timeouts_total"),
        )
    })
}

fn zombies_total() -> &'static IntCounterVec {
    ZOMBIES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "bolt_engine_zombies_total",
                    "Calls terminated by the zombie give-up timer.",
                ),
                &["call"],
            )
            .expect("create bolt_engine_zombies_total"),
        )
    })
}

fn halts_total() -> &'static IntCounterVec {
    HALTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "bolt_engine_halts_total",
                    "Worker-asserted pipeline short-circuits.",
                ),
                &["command"],
            )
            .expect("create bolt_engine_halts_total"),
        )
    })
}

fn expired_results_total() -> &'static IntCounter {
    EXPIRED_RESULTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "bolt_engine_expired_results_total",
                "Completed results removed by the expiry sweep.",
            )
            .expect("create bolt_engine_expired_results_total"),
        )
    })
}

fn pending_requests() -> &'static IntGauge {
    PENDING_REQUESTS.get_or_init(|| {
        register_collector(
            IntGauge::new(
                "bolt_engine_pending_requests",
                "Requests currently tracked in the registry.",
            )
            .expect("create bolt_engine_pending_requests"),
        )
    })
}

pub fn inc_requests_in() {
    requests_in_total().inc();
}

pub fn inc_auth_failure() {
    auth_failures_total().inc();
}

pub fn inc_throttled(group: &str) {
    throttled_total().with_label_values(&[group]).inc();
}

pub fn inc_cache_event(event: &str) {
    cache_events_total().with_label_values(&[event]).inc();
}

pub fn inc_call_in(call: &str) {
    calls_in_total().with_label_values(&[call]).inc();
}

pub fn inc_call_timeout(call: &str) {
    call_timeouts_total().with_label_values(&[call]).inc();
}

pub fn inc_command_timeout(command: &str) {
    command_timeouts_total().with_label_values(&[command]).inc();
}

pub fn inc_zombie(call: &str) {
    zombies_total().with_label_values(&[call]).inc();
}

pub fn inc_halt(command: &str) {
    halts_total().with_label_values(&[command]).inc();
}

pub fn inc_expired_results(count: u64) {
    expired_results_total().inc_by(count);
}

pub fn set_pending_requests(count: usize) {
    pending_requests().set(count as i64);
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = requests_in_total();
    let _ = auth_failures_total();
    let _ = expired_results_total();
    let _ = pending_requests();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;

/// Process-wide runtime counters, surfaced through the read-only `sys`
/// datastore namespace.
pub static SPAWN_PROCS: AtomicU64 = AtomicU64::new(0);
pub static RUN_PROCS: AtomicU64 = AtomicU64::new(0);
pub static HTTP_REQUESTS: AtomicU64 = AtomicU64::new(0);

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Call once early so uptime does not start at the first metrics read.
pub fn init() {
    Lazy::force(&START);
}

pub fn uptime_seconds() -> f64 {
    START.elapsed().as_secs_f64()
}

pub fn record_spawn() {
    SPAWN_PROCS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_run() {
    RUN_PROCS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_http_request() {
    HTTP_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

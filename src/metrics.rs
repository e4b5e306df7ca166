//! Ambient metrics. A handful of counters and gauges describing cache
//! throughput and reconnection behavior, registered lazily against the
//! default prometheus registry.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts};

pub static CACHE_ROW_INSERTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "streamdb_sdk_cache_row_inserts_total",
        "Cumulative number of rows inserted into the client-side row cache",
    )
    .expect("metric options are valid");
    prometheus::register(Box::new(counter.clone())).ok();
    counter
});

pub static CACHE_ROW_DELETES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "streamdb_sdk_cache_row_deletes_total",
        "Cumulative number of rows deleted from the client-side row cache",
    )
    .expect("metric options are valid");
    prometheus::register(Box::new(counter.clone())).ok();
    counter
});

pub static CACHE_ROW_UPDATES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "streamdb_sdk_cache_row_updates_total",
        "Cumulative number of rows updated in the client-side row cache",
    )
    .expect("metric options are valid");
    prometheus::register(Box::new(counter.clone())).ok();
    counter
});

pub static RECONNECT_ATTEMPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("streamdb_sdk_reconnect_attempts_total", "Cumulative number of reconnect attempts by outcome"),
        &["outcome"],
    )
    .expect("metric options are valid");
    prometheus::register(Box::new(counter.clone())).ok();
    counter
});

pub static CONNECTION_STATE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "streamdb_sdk_connection_state",
        "Current session state: 0=Disconnected, 1=Connecting, 2=Connected, 3=Reconnecting",
    )
    .expect("metric options are valid");
    prometheus::register(Box::new(gauge.clone())).ok();
    gauge
});

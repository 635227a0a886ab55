//! Prometheus collectors of the key-value layer.
//!
//! Nothing is served from here. [`REGISTRY`] carries every collector from
//! first use, so the host can gather it directly; a host with its own
//! registry passes that to [`register_custom_metrics`] instead.

use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::Encoder;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;

use crate::errors::BackendError;
use crate::Result;


lazy_static! {
    pub static ref KV_OPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("kv_ops_total", "Backend operations issued"),
        &["backend", "op"]
    )
    .expect("metric can not be created");

    pub static ref KV_OP_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("kv_op_errors_total", "Backend operations that failed, by error kind"),
        &["backend", "op", "kind"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_EVENTS_DELIVERED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_events_delivered_total", "Change events handed to a sink"),
        &["backend"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_EVENTS_DROPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_events_dropped_total", "Change events a sink could not take"),
        &["backend", "reason"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_SUBSCRIPTIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("watch_subscriptions", "Active watch subscriptions"),
        &["backend"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = {
        let registry = Registry::new();
        register_custom_metrics(&registry).expect("fresh registry accepts every collector");
        registry
    };
}

/// Registers every collector with `registry`; fails when one of them is
/// already registered there.
pub fn register_custom_metrics(registry: &Registry) -> Result<()> {
    let collectors: [Box<dyn Collector>; 5] = [
        Box::new(KV_OPS_TOTAL.clone()),
        Box::new(KV_OP_ERRORS_TOTAL.clone()),
        Box::new(WATCH_EVENTS_DELIVERED_TOTAL.clone()),
        Box::new(WATCH_EVENTS_DROPPED_TOTAL.clone()),
        Box::new(WATCH_SUBSCRIPTIONS.clone()),
    ];
    for collector in collectors {
        registry
            .register(collector)
            .map_err(|e| BackendError::Message(format!("could not register metrics: {e}")))?;
    }
    Ok(())
}

/// Text exposition of `registry`
pub fn encode_metrics(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| BackendError::Message(format!("could not encode metrics: {e}")))?;
    String::from_utf8(buffer)
        .map_err(|e| BackendError::Message(format!("metrics are not utf-8: {e}")).into())
}

//! Prometheus metrics
//!
//! Process-wide counters for the transport and the naming service, exposed
//! in text format by the binary's `/metrics` endpoint.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

use crate::error::{Error, Result};

/// How a dispatched call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler returned a value
    Returned,
    /// Handler raised an application error
    Raised,
    /// Transport could not carry out the call
    Failed,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Returned => "returned",
            Outcome::Raised => "raised",
            Outcome::Failed => "failed",
        }
    }
}

static RPC_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "treefs_rpc_calls_total",
        "Remote calls serviced by skeletons",
        &["interface", "outcome"]
    )
    .expect("rpc call counter is registered once")
});

static REGISTRATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "treefs_registrations_total",
        "Storage servers registered with the naming service"
    )
    .expect("registration counter is registered once")
});

static REPLICATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "treefs_replications_total",
        "Replicas added by read-triggered replication"
    )
    .expect("replication counter is registered once")
});

static INVALIDATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "treefs_invalidations_total",
        "Replicas dropped before granting an exclusive lock"
    )
    .expect("invalidation counter is registered once")
});

pub fn record_call(interface: &str, outcome: Outcome) {
    RPC_CALLS
        .with_label_values(&[interface, outcome.as_str()])
        .inc();
}

pub fn record_registration() {
    REGISTRATIONS.inc();
}

pub fn record_replication() {
    REPLICATIONS.inc();
}

pub fn record_invalidations(count: usize) {
    INVALIDATIONS.inc_by(count as u64);
}

/// Render every registered metric in the Prometheus text format.
pub fn gather() -> Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("failed to encode metrics: {}", e)))?;
    Ok(buffer)
}

/// Content type of [`gather`] output.
pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}

// =============================================================================
// Tests
// =============================================================================

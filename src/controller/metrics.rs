//! Prometheus metrics for the DataVolume controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `kubevirt_cdi_datavolume_pending` (gauge): DataVolumes pending on the default storage class.
//! - `cdi_dv_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `cdi_dv_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile duration
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
}

/// Labels for reconcile errors
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    pub kind: String,
}

/// DataVolumes without a storage class that are still Pending or unset
pub static DATA_VOLUME_PENDING: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "kubevirt_cdi_datavolume_pending",
        "Number of DataVolumes pending for default storage class to be configured",
        DATA_VOLUME_PENDING.clone(),
    );

    registry.register(
        "cdi_dv_reconcile_duration_seconds",
        "Duration of DataVolume reconciles in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );

    registry.register(
        "cdi_dv_reconcile_errors",
        "Total number of DataVolume reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );

    registry
});

pub fn set_data_volume_pending(count: i64) {
    DATA_VOLUME_PENDING.set(count);
}

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

/// Render the registry in the Prometheus text format
pub fn encode() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

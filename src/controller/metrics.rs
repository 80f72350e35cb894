//! Prometheus metrics for the SSL termination proxy controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `ssl_proxy_reconcile_duration_seconds` (histogram): pass duration labeled by controller.
//! - `ssl_proxy_reconcile_errors_total` (counter): errors labeled by controller and kind.
//! - `ssl_proxy_certificate_issuance_total` (counter): issuance attempts labeled by result.
//! - `ssl_proxy_service_active` (gauge): 1 when a service's last pass succeeded, else 0.
//! - `ssl_proxy_services` (gauge): number of currently related services.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "ssl-termination"
    pub controller: String,
}

/// Labels for error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see [`crate::Error::kind`]
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct IssuanceLabels {
    /// "success" or "failure"
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub service: String,
}

/// Histogram tracking pass duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static CERTIFICATE_ISSUANCE_TOTAL: Lazy<Family<IssuanceLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static SERVICE_ACTIVE: Lazy<Family<ServiceLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static SERVICES: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

// Counters get their `_total` suffix from the encoder.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "ssl_proxy_reconcile_duration_seconds",
        "Duration of reconciliation passes in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "ssl_proxy_reconcile_errors",
        "Total number of errors raised during reconciliation",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "ssl_proxy_certificate_issuance",
        "Certificate issuance attempts",
        CERTIFICATE_ISSUANCE_TOTAL.clone(),
    );
    registry.register(
        "ssl_proxy_service_active",
        "Whether the last pass left the service active",
        SERVICE_ACTIVE.clone(),
    );
    registry.register(
        "ssl_proxy_services",
        "Number of currently related services",
        SERVICES.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_certificate_issuance(success: bool) {
    let labels = IssuanceLabels {
        result: if success { "success" } else { "failure" }.to_string(),
    };
    CERTIFICATE_ISSUANCE_TOTAL.get_or_create(&labels).inc();
}

pub fn set_service_active(service: &str, active: bool) {
    let labels = ServiceLabels {
        service: service.to_string(),
    };
    SERVICE_ACTIVE.get_or_create(&labels).set(i64::from(active));
}

pub fn remove_service(service: &str) {
    let labels = ServiceLabels {
        service: service.to_string(),
    };
    SERVICE_ACTIVE.remove(&labels);
}

pub fn set_services(count: usize) {
    SERVICES.set(count as i64);
}

/// Render the registry in the Prometheus text format
pub fn encode_registry() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

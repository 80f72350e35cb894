//! Pass outcomes and how they are reported to operators

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::collaborators::StatusSink;
use super::conditions::{conditions_for_outcome, Condition};

/// Reconciliation phase of a single service, or of the proxy as a whole
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ServicePhase {
    /// No consumer related
    Blocked,
    /// Consumers present, certificate not yet issued for their hostnames
    AwaitingCertificate,
    /// Certificate ready, proxy configuration being written
    Configuring,
    Active,
    Failed,
}

impl ServicePhase {
    /// Ordering used when aggregating; `Active` never outranks anything
    fn severity(self) -> u8 {
        match self {
            ServicePhase::Active => 0,
            ServicePhase::Blocked => 1,
            ServicePhase::AwaitingCertificate => 2,
            ServicePhase::Configuring => 3,
            ServicePhase::Failed => 4,
        }
    }
}

impl fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServicePhase::Blocked => write!(f, "Blocked"),
            ServicePhase::AwaitingCertificate => write!(f, "AwaitingCertificate"),
            ServicePhase::Configuring => write!(f, "Configuring"),
            ServicePhase::Active => write!(f, "Active"),
            ServicePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// An error captured during a pass
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PassError {
    /// `None` for errors that affect every service (certificate issuance)
    pub service: Option<String>,
    pub kind: String,
    pub message: String,
    /// Whether the next pass may succeed with unchanged inputs
    pub retriable: bool,
}

/// Result of one reconciliation pass
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub status: ServicePhase,
    pub failed_services: BTreeSet<String>,
    /// Phase of every currently related service
    pub services: BTreeMap<String, ServicePhase>,
    /// Hostnames the proxy is expected to serve
    pub hostnames: BTreeSet<String>,
    pub errors: Vec<PassError>,
    /// Number of collaborator calls made during the pass
    pub actions: usize,
}

impl ReconcileOutcome {
    pub fn new(hostnames: BTreeSet<String>) -> Self {
        Self {
            status: ServicePhase::Blocked,
            failed_services: BTreeSet::new(),
            services: BTreeMap::new(),
            hostnames,
            errors: Vec::new(),
            actions: 0,
        }
    }

    pub fn set_phase(&mut self, service: &str, phase: ServicePhase) {
        if phase == ServicePhase::Failed {
            self.failed_services.insert(service.to_string());
        }
        self.services.insert(service.to_string(), phase);
    }

    pub fn record_error(&mut self, service: Option<&str>, error: &crate::Error) {
        self.errors.push(PassError {
            service: service.map(str::to_string),
            kind: error.kind().to_string(),
            message: error.to_string(),
            retriable: error.is_retriable(),
        });
    }

    /// Mark a service whose teardown failed; it is no longer a current service
    pub fn record_teardown_failure(&mut self, service: &str, error: &crate::Error) {
        self.failed_services.insert(service.to_string());
        self.record_error(Some(service), error);
    }

    /// Compute the overall status from the per-service phases
    pub fn finish(&mut self) {
        let teardown_failed = self
            .failed_services
            .iter()
            .any(|s| !self.services.contains_key(s));

        self.status = if teardown_failed {
            ServicePhase::Failed
        } else if self.services.is_empty() {
            ServicePhase::Blocked
        } else if self.services.values().all(|p| *p == ServicePhase::Active) {
            ServicePhase::Active
        } else {
            self.services
                .values()
                .copied()
                .max_by_key(|p| p.severity())
                .unwrap_or(ServicePhase::Blocked)
        };
    }

    fn error_for(&self, service: &str) -> Option<&PassError> {
        self.errors
            .iter()
            .find(|e| e.service.as_deref() == Some(service))
    }
}

/// Level understood by the status surface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Blocked,
    Maintenance,
    Active,
    Error,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusLevel::Blocked => write!(f, "blocked"),
            StatusLevel::Maintenance => write!(f, "maintenance"),
            StatusLevel::Active => write!(f, "active"),
            StatusLevel::Error => write!(f, "error"),
        }
    }
}

pub struct StatusReporter;

impl StatusReporter {
    pub fn report(outcome: &ReconcileOutcome) -> (StatusLevel, String) {
        match outcome.status {
            ServicePhase::Blocked => (
                StatusLevel::Blocked,
                "Please relate a SSL Termination client".to_string(),
            ),
            ServicePhase::AwaitingCertificate => {
                let mut message = format!(
                    "Waiting for certificate for {}",
                    join(&outcome.hostnames)
                );
                if let Some(err) = outcome.errors.iter().find(|e| e.service.is_none()) {
                    message.push_str(&format!(": {}", err.message));
                }
                (StatusLevel::Maintenance, message)
            }
            ServicePhase::Configuring => {
                let pending: Vec<&str> = outcome
                    .services
                    .iter()
                    .filter(|(_, p)| **p == ServicePhase::Configuring)
                    .map(|(s, _)| s.as_str())
                    .collect();
                (
                    StatusLevel::Maintenance,
                    format!("Configuring proxy for {}", pending.join(", ")),
                )
            }
            ServicePhase::Active => (
                StatusLevel::Active,
                format!(
                    "{} have been registered and are online",
                    join(&outcome.hostnames)
                ),
            ),
            ServicePhase::Failed => {
                let details: Vec<String> = outcome
                    .failed_services
                    .iter()
                    .map(|svc| match outcome.error_for(svc) {
                        Some(err) => format!("{}: {}", svc, err.message),
                        None => svc.clone(),
                    })
                    .collect();
                (
                    StatusLevel::Error,
                    format!("Failed to configure {}", details.join("; ")),
                )
            }
        }
    }
}

fn join(hostnames: &BTreeSet<String>) -> String {
    hostnames
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Status sink that only logs
#[derive(Clone, Debug, Default)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn publish(&self, level: StatusLevel, message: &str) {
        match level {
            StatusLevel::Error => error!(%level, "{}", message),
            StatusLevel::Blocked => warn!(%level, "{}", message),
            StatusLevel::Maintenance | StatusLevel::Active => info!(%level, "{}", message),
        }
    }
}

/// Snapshot served by the REST API
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub level: StatusLevel,
    pub message: String,
    pub updated_at: DateTime<Utc>,
    pub conditions: Vec<Condition>,
    pub last_outcome: Option<ReconcileOutcome>,
}

/// Shared, queryable status surface; also forwards everything to the log
#[derive(Debug)]
pub struct StatusBoard {
    inner: RwLock<StatusSnapshot>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            inner: RwLock::new(StatusSnapshot {
                level: StatusLevel::Maintenance,
                message: "Starting".to_string(),
                updated_at: Utc::now(),
                conditions: Vec::new(),
                last_outcome: None,
            }),
        }
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Store the outcome of a finished pass and derive conditions from it
    pub fn record_outcome(&self, outcome: &ReconcileOutcome) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        conditions_for_outcome(&mut guard.conditions, outcome);
        guard.last_outcome = Some(outcome.clone());
    }
}

impl StatusSink for StatusBoard {
    fn publish(&self, level: StatusLevel, message: &str) {
        LogStatusSink.publish(level, message);

        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.level = level;
        guard.message = message.to_string();
        guard.updated_at = Utc::now();
    }
}

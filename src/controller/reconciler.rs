//! Main reconciler for SSL termination relations
//!
//! One pass compares the desired state built from the relation store with
//! the last-applied state and drives the collaborators until they match.
//! Passes run one at a time; the controller loop triggers one after every
//! relation event and on a periodic resync.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::applied_state::{AppliedState, AppliedStateStore};
use super::collaborators::{CertificateBundle, Collaborators, SiteConfig};
use super::desired_state::{DesiredState, DesiredStateBuilder};
use super::fingerprint::service_fingerprint;
use super::status::{ReconcileOutcome, ServicePhase, StatusBoard, StatusLevel, StatusReporter};
use crate::error::{Error, Result};
use crate::relation::{
    describe_errors, EventSource, RelationEvent, RelationStore, ServiceRequirement,
};

#[cfg(feature = "metrics")]
use super::metrics;

const CONTROLLER_NAME: &str = "ssl-termination";

/// Tunables of the reconciler
#[derive(Clone, Debug)]
pub struct ReconcilerOptions {
    /// Reissue the certificate when hostnames disappear from the union
    pub prune_stale_hostnames: bool,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            prune_stale_hostnames: true,
        }
    }
}

pub struct Reconciler {
    relations: RelationStore,
    applied: AppliedStateStore,
    collaborators: Collaborators,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        applied: AppliedStateStore,
        collaborators: Collaborators,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            relations: RelationStore::new(),
            applied,
            collaborators,
            options,
        }
    }

    pub fn relations(&self) -> &RelationStore {
        &self.relations
    }

    pub fn applied(&self) -> &AppliedState {
        self.applied.state()
    }

    /// Apply a relation event to the store. Invalid upserts are dropped.
    ///
    /// Returns whether the store was touched.
    pub fn handle_event(&mut self, event: RelationEvent) -> bool {
        if let RelationEvent::Upsert(requirement) = &event {
            if let Err(errors) = requirement.validate() {
                warn!(
                    "Rejecting relation data for {}: {}",
                    requirement.service_name,
                    describe_errors(&errors)
                );
                return false;
            }
        }

        match &event {
            RelationEvent::Upsert(req) => info!(
                "Relation {} updated ({} hostname(s), {} backend(s))",
                req.service_name,
                req.hostnames.len(),
                req.backend_addresses.len()
            ),
            RelationEvent::Remove(name) => info!("Relation {} removed", name),
        }
        self.relations.apply(event);
        true
    }

    /// Run one reconciliation pass
    #[instrument(skip(self), fields(services = self.relations.len()))]
    pub async fn reconcile(&mut self) -> ReconcileOutcome {
        let started = Instant::now();
        let desired = DesiredStateBuilder::build(self.relations.all());
        let mut outcome = ReconcileOutcome::new(desired.all_hostnames.clone());

        if desired.is_empty() {
            info!("No SSL termination client related");
            self.teardown_removed(&desired, &mut outcome).await;
            return self.finish(outcome, started);
        }

        let certificate = match self.ensure_certificate(&desired, &mut outcome).await {
            Some(certificate) => certificate,
            None => {
                for requirement in desired.services() {
                    outcome.set_phase(&requirement.service_name, ServicePhase::AwaitingCertificate);
                }
                return self.finish(outcome, started);
            }
        };

        for requirement in desired.services() {
            let name = requirement.service_name.as_str();
            let fingerprint = match service_fingerprint(requirement, &certificate) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    error!("Failed to fingerprint service {}: {}", name, e);
                    outcome.set_phase(name, ServicePhase::Failed);
                    outcome.record_error(Some(name), &e);
                    continue;
                }
            };

            if self.applied.state().last_config_hash.get(name) == Some(&fingerprint) {
                debug!("Service {} unchanged, skipping", name);
                outcome.set_phase(name, ServicePhase::Active);
                continue;
            }

            self.publish(
                StatusLevel::Maintenance,
                &format!("Configuring proxy for {}", name),
            );

            match self
                .apply_service(requirement, &certificate, fingerprint, &mut outcome)
                .await
            {
                Ok(()) => {
                    info!("Service {} configured", name);
                    outcome.set_phase(name, ServicePhase::Active);
                }
                Err(e) => {
                    error!(
                        retriable = e.is_retriable(),
                        "Failed to configure service {}: {}",
                        name,
                        e
                    );
                    outcome.set_phase(name, ServicePhase::Failed);
                    outcome.record_error(Some(name), &e);
                }
            }
        }

        self.teardown_removed(&desired, &mut outcome).await;
        self.finish(outcome, started)
    }

    /// Make sure a certificate covering the desired hostnames is committed.
    ///
    /// Returns `None` when issuance failed; the pass must stop there.
    async fn ensure_certificate(
        &mut self,
        desired: &DesiredState,
        outcome: &mut ReconcileOutcome,
    ) -> Option<CertificateBundle> {
        let applied = self.applied.state();
        let missing: Vec<&String> = desired
            .all_hostnames
            .difference(&applied.last_hostnames)
            .collect();
        let stale = self.options.prune_stale_hostnames
            && !applied.last_hostnames.is_subset(&desired.all_hostnames);

        if let Some(certificate) = &applied.certificate {
            if missing.is_empty() && !stale {
                debug!("Certificate already covers every hostname");
                return Some(certificate.clone());
            }
        }

        let hostnames = join(&desired.all_hostnames);
        if !missing.is_empty() {
            info!(
                "Requesting certificate for {} (new: {})",
                hostnames,
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        } else if stale {
            info!("Requesting certificate for {} (hostnames dropped)", hostnames);
        } else {
            info!("Requesting certificate for {} (none committed yet)", hostnames);
        }
        self.publish(
            StatusLevel::Maintenance,
            &format!("Requesting certificate for {}", hostnames),
        );

        outcome.actions += 1;
        let issued = self
            .collaborators
            .authority
            .issue(&desired.all_hostnames)
            .await
            .and_then(|bundle| {
                self.applied
                    .commit_certificate(desired.all_hostnames.clone(), bundle.clone())?;
                Ok(bundle)
            });

        #[cfg(feature = "metrics")]
        metrics::inc_certificate_issuance(issued.is_ok());

        match issued {
            Ok(bundle) => {
                info!("Certificate {} issued for {}", bundle.fingerprint, hostnames);
                Some(bundle)
            }
            Err(e) => {
                error!("Certificate issuance for {} failed: {}", hostnames, e);
                outcome.record_error(None, &e);
                None
            }
        }
    }

    /// Regenerate the credential file and the site of one service, then
    /// commit its fingerprint. Nothing is committed unless every step worked.
    async fn apply_service(
        &mut self,
        requirement: &ServiceRequirement,
        certificate: &CertificateBundle,
        fingerprint: String,
        outcome: &mut ReconcileOutcome,
    ) -> Result<()> {
        let name = requirement.service_name.as_str();
        let credentials = &self.collaborators.credentials;

        outcome.actions += 1;
        if requirement.basic_auth.is_empty() {
            credentials.delete_basic_auth_file(name).await?;
        } else {
            credentials
                .write_basic_auth_file(name, &requirement.basic_auth)
                .await?;
        }

        outcome.actions += 1;
        self.collaborators
            .proxy
            .render(&SiteConfig {
                service: name,
                backend_addresses: &requirement.backend_addresses,
                load_balancing: requirement.load_balancing,
                hostnames: &requirement.hostnames,
                certificate,
                auth_enabled: requirement.auth_enabled(),
            })
            .await?;

        self.applied.commit_service(name, fingerprint)
    }

    /// Tear down services that are applied but no longer desired
    async fn teardown_removed(&mut self, desired: &DesiredState, outcome: &mut ReconcileOutcome) {
        let removed: Vec<String> = self
            .applied
            .state()
            .last_config_hash
            .keys()
            .filter(|name| !desired.contains_service(name))
            .cloned()
            .collect();

        for name in removed {
            info!("Removing proxy configuration for {}", name);
            match self.teardown_service(&name, outcome).await {
                Ok(()) => {
                    #[cfg(feature = "metrics")]
                    metrics::remove_service(&name);
                }
                Err(e) => {
                    error!("Failed to remove service {}: {}", name, e);
                    outcome.record_teardown_failure(&name, &e);
                }
            }
        }
    }

    async fn teardown_service(&mut self, name: &str, outcome: &mut ReconcileOutcome) -> Result<()> {
        outcome.actions += 1;
        self.collaborators
            .credentials
            .delete_basic_auth_file(name)
            .await?;
        outcome.actions += 1;
        self.collaborators.proxy.remove(name).await?;
        self.applied.forget_service(name)
    }

    fn finish(&self, mut outcome: ReconcileOutcome, started: Instant) -> ReconcileOutcome {
        outcome.finish();

        let (level, message) = StatusReporter::report(&outcome);
        self.publish(level, &message);

        #[cfg(feature = "metrics")]
        {
            metrics::observe_reconcile_duration_seconds(
                CONTROLLER_NAME,
                started.elapsed().as_secs_f64(),
            );
            for err in &outcome.errors {
                metrics::inc_reconcile_error(CONTROLLER_NAME, &err.kind);
            }
            for (service, phase) in &outcome.services {
                metrics::set_service_active(service, *phase == ServicePhase::Active);
            }
            metrics::set_services(outcome.services.len());
        }

        debug!(
            controller = CONTROLLER_NAME,
            status = %outcome.status,
            actions = outcome.actions,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reconciliation pass finished"
        );
        outcome
    }

    fn publish(&self, level: StatusLevel, message: &str) {
        self.collaborators.status.publish(level, message);
    }
}

fn join(hostnames: &BTreeSet<String>) -> String {
    hostnames
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Shared state for the controller
pub struct ControllerState {
    /// Held for the whole pass, so passes never overlap
    pub reconciler: Mutex<Reconciler>,
    pub status: Arc<StatusBoard>,
}

impl ControllerState {
    pub fn new(reconciler: Reconciler, status: Arc<StatusBoard>) -> Self {
        Self {
            reconciler: Mutex::new(reconciler),
            status,
        }
    }

    /// Run a single pass and record its outcome on the status board
    pub async fn reconcile_once(&self) -> ReconcileOutcome {
        let mut reconciler = self.reconciler.lock().await;
        let outcome = reconciler.reconcile().await;
        self.status.record_outcome(&outcome);
        outcome
    }

    pub async fn handle_event(&self, event: RelationEvent) -> bool {
        self.reconciler.lock().await.handle_event(event)
    }
}

/// Main entry point of the controller loop
///
/// Runs a pass at start-up, after every relation event and, when `resync` is
/// set, periodically. Returns when the event source closes or on Ctrl-C.
pub async fn run_controller<E: EventSource>(
    state: Arc<ControllerState>,
    mut events: E,
    resync: Option<Duration>,
) -> Result<()> {
    info!("Starting SSL termination controller");

    let outcome = state.reconcile_once().await;
    info!("Initial pass finished with status {}", outcome.status);

    let mut resync_timer = resync.map(|period| {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer
    });
    if let Some(timer) = resync_timer.as_mut() {
        // The first tick completes immediately.
        timer.tick().await;
    }

    loop {
        tokio::select! {
            event = events.next_event() => {
                let Some(event) = event else {
                    info!("Relation event source closed, stopping controller");
                    break;
                };
                if state.handle_event(event).await {
                    let outcome = state.reconcile_once().await;
                    debug!("Pass after relation event finished with status {}", outcome.status);
                }
            }
            _ = tick(&mut resync_timer) => {
                debug!("Periodic resync");
                state.reconcile_once().await;
            }
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    return Err(Error::IoError(e));
                }
                info!("Shutdown signal received, stopping controller");
                break;
            }
        }
    }

    Ok(())
}

async fn tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

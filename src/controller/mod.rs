//! Controller module for SSL termination relations
//! This module contains the controller loop, reconciliation logic,
//! state bookkeeping and status reporting.

pub mod applied_state;
pub mod collaborators;
pub mod conditions;
pub mod desired_state;
pub mod fingerprint;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
pub mod status;

pub use applied_state::{AppliedState, AppliedStateStore};
pub use collaborators::{
    CertificateAuthority, CertificateBundle, Collaborators, CredentialStore, ProxyConfigurer,
    SiteConfig, StatusSink,
};
pub use desired_state::{DesiredState, DesiredStateBuilder};
pub use fingerprint::service_fingerprint;
pub use reconciler::{run_controller, ControllerState, Reconciler, ReconcilerOptions};
pub use status::{
    LogStatusSink, PassError, ReconcileOutcome, ServicePhase, StatusBoard, StatusLevel,
    StatusReporter, StatusSnapshot,
};

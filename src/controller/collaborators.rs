//! Interfaces of the layers the reconciler drives
//!
//! The reconciler never touches certificates, credential files or proxy
//! configuration directly. It calls these traits, and the binary wires in the
//! implementations from [`crate::proxy`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::StatusLevel;
use crate::error::Result;
use crate::relation::{BasicAuthCredential, LoadBalancingMode};

/// Location and identity of an issued certificate
///
/// Only paths are carried around, so the bundle can be persisted in the
/// applied state without leaking key material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateBundle {
    pub private_key: PathBuf,
    pub full_chain: PathBuf,
    pub dh_params: PathBuf,
    /// Hex SHA-256 of the leaf certificate
    pub fingerprint: String,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

/// Everything needed to render the proxy site of one service
#[derive(Clone, Debug)]
pub struct SiteConfig<'a> {
    pub service: &'a str,
    pub backend_addresses: &'a [String],
    pub load_balancing: LoadBalancingMode,
    pub hostnames: &'a BTreeSet<String>,
    pub certificate: &'a CertificateBundle,
    pub auth_enabled: bool,
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Issue one certificate covering every hostname in the set.
    ///
    /// Fails with [`crate::Error::IssuanceError`].
    async fn issue(&self, hostnames: &BTreeSet<String>) -> Result<CertificateBundle>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn write_basic_auth_file(
        &self,
        service: &str,
        users: &BTreeMap<String, BasicAuthCredential>,
    ) -> Result<()>;

    /// Remove the service's credential file; a missing file is not an error
    async fn delete_basic_auth_file(&self, service: &str) -> Result<()>;
}

#[async_trait]
pub trait ProxyConfigurer: Send + Sync {
    /// Render and apply the site for one service.
    ///
    /// Fails with [`crate::Error::ConfigError`].
    async fn render(&self, site: &SiteConfig<'_>) -> Result<()>;

    /// Remove the site of a service that is no longer related
    async fn remove(&self, service: &str) -> Result<()>;
}

/// Operator-facing status surface
pub trait StatusSink: Send + Sync {
    fn publish(&self, level: StatusLevel, message: &str);
}

/// The set of collaborators a reconciler drives
#[derive(Clone)]
pub struct Collaborators {
    pub authority: Arc<dyn CertificateAuthority>,
    pub credentials: Arc<dyn CredentialStore>,
    pub proxy: Arc<dyn ProxyConfigurer>,
    pub status: Arc<dyn StatusSink>,
}

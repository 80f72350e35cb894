//! Content fingerprints used to skip unchanged services

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::collaborators::CertificateBundle;
use crate::error::Result;
use crate::relation::{BasicAuthCredential, LoadBalancingMode, ServiceRequirement};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FingerprintInput<'a> {
    hostnames: &'a BTreeSet<String>,
    backend_addresses: &'a [String],
    load_balancing: LoadBalancingMode,
    basic_auth: &'a BTreeMap<String, BasicAuthCredential>,
    certificate: &'a str,
}

/// Fingerprint of everything that ends up in a service's proxy site and
/// credential file.
///
/// `requested_at` is not part of the fingerprint.
pub fn service_fingerprint(
    requirement: &ServiceRequirement,
    certificate: &CertificateBundle,
) -> Result<String> {
    let input = FingerprintInput {
        hostnames: &requirement.hostnames,
        backend_addresses: &requirement.backend_addresses,
        load_balancing: requirement.load_balancing,
        basic_auth: &requirement.basic_auth,
        certificate: &certificate.fingerprint,
    };

    // BTree collections and a fixed field order keep the encoding canonical.
    let encoded = serde_json::to_vec(&input)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

//! Self-signed certificate authority
//!
//! Issues one certificate whose subject alternative names are the full
//! hostname union. Files land under `<cert_dir>/live/<primary>/` the same
//! way an ACME client lays them out, so the nginx sites do not care which
//! authority produced them.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveTime, Utc};
use rcgen::{date_time_ymd, CertificateParams, DistinguishedName, DnType, KeyPair};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::controller::applied_state::write_atomically;
use crate::controller::{CertificateAuthority, CertificateBundle};
use crate::error::{Error, Result};

/// RFC 7919 `ffdhe2048` group
pub const FFDHE2048_PEM: &str = "-----BEGIN DH PARAMETERS-----
MIIBCAKCAQEA//////////+t+FRYortKmq/cViAnPTzx2LnFg84tNpWp4TZBFGQz
+8yTnc4kmz75fS/jY2MMddj2gbICrsRhetPfHtXV/WVhJDP1H18GbtCFY2VVPe0a
87VXE15/V8k1mE8McODmi3fipona8+/och3xWKE2rec1MKzKT0g6eXq8CrGCsyT7
YdEIqUuyyOP7uWrat2DX9GgdT0Kj3jlN9K5W7edjcrsZCwenyO4KbXCeAvzhzffi
7MA0BM0oNC9hkXL+nOmFg/+OTxIy7vKBg8P+OxtMb61zO7X8vC7CIAXFjvGDfRaD
ssbzSibBsu/6iGtCOGEoXJf//////////wIBAg==
-----END DH PARAMETERS-----
";

const PRIVATE_KEY_MODE: u32 = 0o600;

#[derive(Clone, Debug)]
pub struct SelfSignedAuthority {
    cert_dir: PathBuf,
    validity_days: u32,
}

impl SelfSignedAuthority {
    pub fn new(cert_dir: impl Into<PathBuf>, validity_days: u32) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            validity_days,
        }
    }

    /// Directory holding the key and chain for a given primary hostname
    pub fn live_dir(&self, primary: &str) -> PathBuf {
        self.cert_dir
            .join("live")
            .join(primary.trim_start_matches("*."))
    }

    pub fn dh_params_path(&self) -> PathBuf {
        self.cert_dir.join("dhparam.pem")
    }
}

#[async_trait]
impl CertificateAuthority for SelfSignedAuthority {
    async fn issue(&self, hostnames: &BTreeSet<String>) -> Result<CertificateBundle> {
        let primary = hostnames
            .iter()
            .next()
            .ok_or_else(|| Error::IssuanceError("no hostnames to certify".to_string()))?;

        let live_dir = self.live_dir(primary);
        let dh_params = self.dh_params_path();
        let sans: Vec<String> = hostnames.iter().cloned().collect();
        let validity_days = self.validity_days;

        // Key generation is CPU-bound
        tokio::task::spawn_blocking(move || {
            issue_blocking(&live_dir, &dh_params, sans, validity_days)
        })
        .await
        .map_err(|e| Error::IssuanceError(format!("issuance task failed: {}", e)))?
    }
}

fn issue_blocking(
    live_dir: &Path,
    dh_params: &Path,
    sans: Vec<String>,
    validity_days: u32,
) -> Result<CertificateBundle> {
    let primary = sans.first().cloned().unwrap_or_default();
    let issuance = |e: rcgen::Error| Error::IssuanceError(e.to_string());

    let now = Utc::now();
    let expires = now + Duration::days(i64::from(validity_days));

    let mut params = CertificateParams::new(sans.clone()).map_err(issuance)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, primary.as_str());
    dn.push(DnType::OrganizationName, "ssl-termination-proxy");
    params.distinguished_name = dn;
    params.not_before = date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
    params.not_after = date_time_ymd(expires.year(), expires.month() as u8, expires.day() as u8);

    let key_pair = KeyPair::generate().map_err(issuance)?;
    let cert = params.self_signed(&key_pair).map_err(issuance)?;
    let fingerprint = hex::encode(Sha256::digest(cert.der().as_ref()));

    std::fs::create_dir_all(live_dir)?;
    let private_key = live_dir.join("privkey.pem");
    let full_chain = live_dir.join("fullchain.pem");

    write_atomically(
        &private_key,
        key_pair.serialize_pem().as_bytes(),
        Some(PRIVATE_KEY_MODE),
    )?;
    write_atomically(&full_chain, cert.pem().as_bytes(), None)?;

    if !dh_params.exists() {
        if let Some(parent) = dh_params.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomically(dh_params, FFDHE2048_PEM.as_bytes(), None)?;
        debug!("Wrote DH parameters to {}", dh_params.display());
    }

    let not_after = expires
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc();

    info!(
        "Issued self-signed certificate {} for {} (expires {})",
        fingerprint,
        sans.join(", "),
        not_after
    );

    Ok(CertificateBundle {
        private_key,
        full_chain,
        dh_params: dh_params.to_path_buf(),
        fingerprint,
        not_after: Some(not_after),
    })
}

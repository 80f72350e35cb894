//! Basic-auth credential files in the `htpasswd` `{SSHA}` format

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::controller::applied_state::write_atomically;
use crate::controller::CredentialStore;
use crate::error::Result;
use crate::relation::BasicAuthCredential;

const SALT_LEN: usize = 8;
const SSHA_PREFIX: &str = "{SSHA}";
/// Readable by the nginx group, never by others
const FILE_MODE: u32 = 0o640;

/// One credential file per service, `<dir>/<service>`
#[derive(Clone, Debug)]
pub struct HtpasswdStore {
    dir: PathBuf,
}

impl HtpasswdStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, service: &str) -> PathBuf {
        self.dir.join(service)
    }
}

/// Build one `user:{SSHA}...` line
pub fn ssha_entry(username: &str, password: &str, salt: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    let mut payload = hasher.finalize().to_vec();
    payload.extend_from_slice(salt);
    format!("{}:{}{}", username, SSHA_PREFIX, STANDARD.encode(payload))
}

/// Check a password against a `user:{SSHA}...` line
pub fn verify_ssha_entry(line: &str, username: &str, password: &str) -> bool {
    let Some((user, hash)) = line.split_once(':') else {
        return false;
    };
    let Some(encoded) = hash.strip_prefix(SSHA_PREFIX) else {
        return false;
    };
    let Ok(payload) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    // SHA-1 digest is 20 bytes, the rest is salt
    if user != username || payload.len() <= 20 {
        return false;
    }
    let salt = &payload[20..];
    ssha_entry(username, password, salt) == line.trim_end()
}

fn render_file(users: &BTreeMap<String, BasicAuthCredential>) -> String {
    let mut out = String::new();
    for (username, credential) in users {
        let salt: [u8; SALT_LEN] = rand::random();
        out.push_str(&ssha_entry(username, credential.expose(), &salt));
        out.push('\n');
    }
    out
}

#[async_trait]
impl CredentialStore for HtpasswdStore {
    async fn write_basic_auth_file(
        &self,
        service: &str,
        users: &BTreeMap<String, BasicAuthCredential>,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(service);
        write_atomically(&path, render_file(users).as_bytes(), Some(FILE_MODE))?;
        info!(
            "Wrote {} basic-auth user(s) for {} to {}",
            users.len(),
            service,
            path.display()
        );
        Ok(())
    }

    async fn delete_basic_auth_file(&self, service: &str) -> Result<()> {
        let path = self.path_for(service);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed basic-auth file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No basic-auth file for {}", service);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

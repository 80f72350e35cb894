//! Last-applied state, persisted between passes and restarts
//!
//! Every mutation writes a complete new document to a temporary file and
//! renames it over the old one. The in-memory copy is swapped only after the
//! rename succeeded, so neither copy ever reflects a half-applied change.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::collaborators::CertificateBundle;
use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedState {
    /// Hostnames covered by the committed certificate
    #[serde(default)]
    pub last_hostnames: BTreeSet<String>,

    #[serde(default)]
    pub certificate: Option<CertificateBundle>,

    /// Fingerprint of the configuration last applied per service
    #[serde(default)]
    pub last_config_hash: BTreeMap<String, String>,
}

/// Owner of the [`AppliedState`]; the only way to mutate it
#[derive(Debug)]
pub struct AppliedStateStore {
    path: Option<PathBuf>,
    state: AppliedState,
}

impl AppliedStateStore {
    /// A store that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: AppliedState::default(),
        }
    }

    /// Load the state file, starting empty if it does not exist yet
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => {
                let state: AppliedState = serde_json::from_slice(&bytes)?;
                info!(
                    "Loaded applied state from {} ({} service(s))",
                    path.display(),
                    state.last_config_hash.len()
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No applied state at {}, starting fresh", path.display());
                AppliedState::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            state,
        })
    }

    pub fn state(&self) -> &AppliedState {
        &self.state
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record a freshly issued certificate and the hostnames it covers
    pub fn commit_certificate(
        &mut self,
        hostnames: BTreeSet<String>,
        certificate: CertificateBundle,
    ) -> Result<()> {
        self.update(|state| {
            state.last_hostnames = hostnames;
            state.certificate = Some(certificate);
        })
    }

    /// Record the fingerprint of a successfully applied service
    pub fn commit_service(&mut self, service: &str, fingerprint: String) -> Result<()> {
        self.update(|state| {
            state
                .last_config_hash
                .insert(service.to_string(), fingerprint);
        })
    }

    /// Drop a torn-down service
    pub fn forget_service(&mut self, service: &str) -> Result<()> {
        if !self.state.last_config_hash.contains_key(service) {
            return Ok(());
        }
        self.update(|state| {
            state.last_config_hash.remove(service);
        })
    }

    fn update(&mut self, mutate: impl FnOnce(&mut AppliedState)) -> Result<()> {
        let mut next = self.state.clone();
        mutate(&mut next);

        if let Some(path) = &self.path {
            write_atomically(path, &serde_json::to_vec_pretty(&next)?, None)?;
        }

        self.state = next;
        Ok(())
    }
}

/// Write `contents` to a sibling temp file, then rename it into place
///
/// When `mode` is given the temp file carries it before the rename, so the
/// final path never exposes the contents with looser permissions.
pub(crate) fn write_atomically(
    path: &Path,
    contents: &[u8],
    mode: Option<u32>,
) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let result = write_temp(&tmp, contents, mode).and_then(|()| std::fs::rename(&tmp, path));
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn write_temp(tmp: &Path, contents: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(tmp)?;
    // An existing temp file keeps its old mode
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> CertificateBundle {
        CertificateBundle {
            private_key: PathBuf::from("/certs/privkey.pem"),
            full_chain: PathBuf::from("/certs/fullchain.pem"),
            dh_params: PathBuf::from("/certs/dhparam.pem"),
            fingerprint: "abc".to_string(),
            not_after: None,
        }
    }

    #[test]
    fn test_load_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppliedStateStore::load(dir.path().join("state.json")).unwrap();
        assert_eq!(store.state(), &AppliedState::default());
    }

    #[test]
    fn test_commits_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut store = AppliedStateStore::load(&path).unwrap();
        let hosts: BTreeSet<String> = ["a.example.com".to_string()].into();
        store.commit_certificate(hosts.clone(), bundle()).unwrap();
        store.commit_service("svc-a", "fp-a".to_string()).unwrap();
        store.commit_service("svc-b", "fp-b".to_string()).unwrap();
        store.forget_service("svc-b").unwrap();

        let reloaded = AppliedStateStore::load(&path).unwrap();
        assert_eq!(reloaded.state().last_hostnames, hosts);
        assert_eq!(reloaded.state().certificate, Some(bundle()));
        assert_eq!(
            reloaded.state().last_config_hash,
            BTreeMap::from([("svc-a".to_string(), "fp-a".to_string())])
        );
        // No temp file left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_failed_write_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("state.json");
        let mut store = AppliedStateStore::load(&path).unwrap();

        assert!(store.commit_service("svc-a", "fp".to_string()).is_err());
        assert!(store.state().last_config_hash.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(AppliedStateStore::load(&path).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomically_applies_mode_before_rename() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("privkey.pem");
        // A stale temp file with open permissions must not leak its mode
        let stale = dir.path().join(".privkey.pem.tmp");
        std::fs::write(&stale, "old").unwrap();
        std::fs::set_permissions(&stale, std::fs::Permissions::from_mode(0o666)).unwrap();

        write_atomically(&path, b"secret", Some(0o600)).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(std::fs::read(&path).unwrap(), b"secret");
        assert!(!stale.exists());
    }

    #[test]
    fn test_in_memory_store() {
        let mut store = AppliedStateStore::in_memory();
        store.commit_service("svc-a", "fp".to_string()).unwrap();
        store.forget_service("never-seen").unwrap();
        assert_eq!(store.state().last_config_hash.len(), 1);
        assert!(store.path().is_none());
    }
}

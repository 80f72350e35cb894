//! Runtime configuration
//!
//! Loaded from an optional TOML file; every field has a default so an
//! empty file (or no file at all) yields a working setup for a stock
//! nginx install. Command-line flags override individual fields.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::ReconcilerOptions;
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Where `<service>.conf` site files are written
    pub sites_dir: PathBuf,
    /// Where per-service basic-auth files are written
    pub htpasswd_dir: PathBuf,
    /// Root of `live/<primary>/` certificate directories
    pub cert_dir: PathBuf,
    /// Persisted applied state
    pub state_file: PathBuf,
    /// Directory of relation files to watch, if any
    pub relations_dir: Option<PathBuf>,
    pub relations_poll_interval_secs: u64,
    /// Periodic resync; 0 disables it
    pub resync_interval_secs: u64,
    pub nginx: NginxSettings,
    pub certificate: CertificateSettings,
    pub api: ApiSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NginxSettings {
    pub validate_command: Vec<String>,
    pub reload_command: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CertificateSettings {
    pub validity_days: u32,
    /// Reissue the certificate when hostnames are dropped
    pub prune_stale_hostnames: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiSettings {
    pub enabled: bool,
    pub listen: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            sites_dir: PathBuf::from("/etc/nginx/sites-enabled"),
            htpasswd_dir: PathBuf::from("/etc/nginx/.htpasswd"),
            cert_dir: PathBuf::from("/etc/letsencrypt"),
            state_file: PathBuf::from("/var/lib/ssl-termination-proxy/applied-state.json"),
            relations_dir: None,
            relations_poll_interval_secs: 5,
            resync_interval_secs: 300,
            nginx: NginxSettings::default(),
            certificate: CertificateSettings::default(),
            api: ApiSettings::default(),
        }
    }
}

impl Default for NginxSettings {
    fn default() -> Self {
        Self {
            validate_command: vec!["nginx".to_string(), "-t".to_string()],
            reload_command: vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()],
        }
    }
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            validity_days: 90,
            prune_stale_hostnames: true,
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Load from `path`, or return the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        for (name, path) in [
            ("sites_dir", &self.sites_dir),
            ("htpasswd_dir", &self.htpasswd_dir),
            ("cert_dir", &self.cert_dir),
            ("state_file", &self.state_file),
        ] {
            if path.as_os_str().is_empty() {
                problems.push(format!("{} must not be empty", name));
            }
        }
        if self.certificate.validity_days == 0 {
            problems.push("certificate.validity_days must be at least 1".to_string());
        }
        if self.relations_dir.is_some() && self.relations_poll_interval_secs == 0 {
            problems.push("relations_poll_interval_secs must be at least 1".to_string());
        }
        if self.api.enabled && self.api.listen.parse::<SocketAddr>().is_err() {
            problems.push(format!(
                "api.listen '{}' is not a socket address",
                self.api.listen
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigError(problems.join("; ")))
        }
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }

    pub fn relations_poll_interval(&self) -> Duration {
        Duration::from_secs(self.relations_poll_interval_secs.max(1))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.api
            .listen
            .parse()
            .map_err(|e| Error::ConfigError(format!("invalid api.listen: {}", e)))
    }

    pub fn reconciler_options(&self) -> ReconcilerOptions {
        ReconcilerOptions {
            prune_stale_hostnames: self.certificate.prune_stale_hostnames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProxyConfig::default();
        config.validate().unwrap();
        assert_eq!(config.resync_interval(), Some(Duration::from_secs(300)));
        assert!(config.reconciler_options().prune_stale_hostnames);
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        assert_eq!(ProxyConfig::from_toml("").unwrap(), ProxyConfig::default());
    }

    #[test]
    fn test_partial_file_overrides() {
        let config = ProxyConfig::from_toml(
            r#"
            sites_dir = "/tmp/sites"
            relations_dir = "/tmp/relations"
            resync_interval_secs = 0

            [nginx]
            validate_command = []

            [certificate]
            validity_days = 30
            prune_stale_hostnames = false

            [api]
            listen = "127.0.0.1:9090"
            "#,
        )
        .unwrap();

        assert_eq!(config.sites_dir, PathBuf::from("/tmp/sites"));
        assert_eq!(config.relations_dir, Some(PathBuf::from("/tmp/relations")));
        assert_eq!(config.resync_interval(), None);
        assert!(config.nginx.validate_command.is_empty());
        assert_eq!(config.nginx.reload_command, vec!["nginx", "-s", "reload"]);
        assert_eq!(config.certificate.validity_days, 30);
        assert!(!config.reconciler_options().prune_stale_hostnames);
        assert_eq!(config.listen_addr().unwrap().port(), 9090);
        assert!(config.api.enabled);
    }

    #[test]
    fn test_zero_validity_rejected() {
        let err = ProxyConfig::from_toml("[certificate]\nvalidity_days = 0\n").unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("validity_days"));
    }

    #[test]
    fn test_bad_listen_rejected() {
        let err = ProxyConfig::from_toml("[api]\nlisten = \"not-an-address\"\n").unwrap_err();
        assert!(err.to_string().contains("api.listen"));

        // Ignored when the API is off
        ProxyConfig::from_toml("[api]\nenabled = false\nlisten = \"nope\"\n").unwrap();
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = ProxyConfig::from_toml("site_dir = \"/typo\"\n").unwrap_err();
        assert_eq!(err.kind(), "toml");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.toml");
        std::fs::write(&path, "resync_interval_secs = 60\n").unwrap();

        let config = ProxyConfig::load(Some(&path)).unwrap();
        assert_eq!(config.resync_interval(), Some(Duration::from_secs(60)));

        let missing = ProxyConfig::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert_eq!(missing.kind(), "config");
        assert_eq!(ProxyConfig::load(None).unwrap(), ProxyConfig::default());
    }
}

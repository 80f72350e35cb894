//! nginx site configuration
//!
//! Each service gets `<sites_dir>/<service>.conf` with an upstream block,
//! a plain-HTTP server that redirects to HTTPS and a TLS server block.
//! A written site is validated before nginx is reloaded; when validation
//! fails the previous file is put back.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::controller::applied_state::write_atomically;
use crate::controller::{ProxyConfigurer, SiteConfig};
use crate::error::{Error, Result};
use crate::relation::LoadBalancingMode;

#[derive(Clone, Debug)]
pub struct NginxConfigurer {
    sites_dir: PathBuf,
    htpasswd_dir: PathBuf,
    validate_command: Vec<String>,
    reload_command: Vec<String>,
}

impl NginxConfigurer {
    pub fn new(sites_dir: impl Into<PathBuf>, htpasswd_dir: impl Into<PathBuf>) -> Self {
        Self {
            sites_dir: sites_dir.into(),
            htpasswd_dir: htpasswd_dir.into(),
            validate_command: Vec::new(),
            reload_command: Vec::new(),
        }
    }

    /// Command run after writing a site, e.g. `nginx -t`. Empty skips the check.
    pub fn with_validate_command(mut self, command: Vec<String>) -> Self {
        self.validate_command = command;
        self
    }

    /// Command run to apply changes, e.g. `nginx -s reload`. Empty skips it.
    pub fn with_reload_command(mut self, command: Vec<String>) -> Self {
        self.reload_command = command;
        self
    }

    pub fn site_path(&self, service: &str) -> PathBuf {
        self.sites_dir.join(format!("{}.conf", service))
    }

    pub fn htpasswd_path(&self, service: &str) -> PathBuf {
        self.htpasswd_dir.join(service)
    }

    async fn reload(&self) -> Result<()> {
        run_command(&self.reload_command).await
    }
}

/// Render the site file for one service
pub fn render_site(site: &SiteConfig<'_>, htpasswd_path: &Path) -> String {
    let server_names = site
        .hostnames
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");

    let mut upstream = String::new();
    match site.load_balancing {
        LoadBalancingMode::RoundRobin => {}
        LoadBalancingMode::LeastConn => upstream.push_str("    least_conn;\n"),
        LoadBalancingMode::IpHash => upstream.push_str("    ip_hash;\n"),
    }
    for backend in site.backend_addresses {
        upstream.push_str(&format!("    server {};\n", backend));
    }

    let auth = if site.auth_enabled {
        format!(
            "        auth_basic \"Restricted\";\n        auth_basic_user_file {};\n",
            htpasswd_path.display()
        )
    } else {
        String::new()
    };

    format!(
        r#"# Managed by ssl-termination-proxy; local edits are overwritten.
upstream {service} {{
{upstream}}}

server {{
    listen 80;
    listen [::]:80;
    server_name {server_names};
    return 301 https://$host$request_uri;
}}

server {{
    listen 443 ssl;
    listen [::]:443 ssl;
    http2 on;
    server_name {server_names};

    ssl_certificate {full_chain};
    ssl_certificate_key {private_key};
    ssl_dhparam {dh_params};
    ssl_protocols TLSv1.2 TLSv1.3;
    ssl_prefer_server_ciphers off;
    ssl_session_cache shared:SSL:10m;
    ssl_session_timeout 1d;

    location / {{
{auth}        proxy_pass http://{service};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}
}}
"#,
        service = site.service,
        upstream = upstream,
        server_names = server_names,
        full_chain = site.certificate.full_chain.display(),
        private_key = site.certificate.private_key.display(),
        dh_params = site.certificate.dh_params.display(),
        auth = auth,
    )
}

/// Run an external command; an empty command is a no-op
pub async fn run_command(command: &[String]) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        return Ok(());
    };
    let cmdline = command.join(" ");
    debug!("Running `{}`", cmdline);

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::ConfigError(format!("failed to run `{}`: {}", cmdline, e)))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::ConfigError(format!(
            "`{}` exited with {}: {}",
            cmdline,
            output.status,
            stderr.trim()
        )))
    }
}

fn read_existing(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn restore(path: &Path, previous: Option<Vec<u8>>) -> std::io::Result<()> {
    match previous {
        Some(bytes) => write_atomically(path, &bytes, None),
        None => match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    }
}

#[async_trait]
impl ProxyConfigurer for NginxConfigurer {
    #[instrument(skip(self, site), fields(service = site.service))]
    async fn render(&self, site: &SiteConfig<'_>) -> Result<()> {
        std::fs::create_dir_all(&self.sites_dir)?;
        let path = self.site_path(site.service);
        let contents = render_site(site, &self.htpasswd_path(site.service));

        let previous = read_existing(&path)?;
        write_atomically(&path, contents.as_bytes(), None)?;

        if let Err(e) = run_command(&self.validate_command).await {
            warn!(
                "Site for {} failed validation, restoring previous file: {}",
                site.service, e
            );
            restore(&path, previous)?;
            return Err(e);
        }

        self.reload().await?;
        info!("Site {} written to {}", site.service, path.display());
        Ok(())
    }

    async fn remove(&self, service: &str) -> Result<()> {
        let path = self.site_path(service);
        match std::fs::remove_file(&path) {
            Ok(()) => info!("Removed site {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Site {} already absent", path.display())
            }
            Err(e) => return Err(e.into()),
        }
        self.reload().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::CertificateBundle;
    use std::collections::BTreeSet;

    fn bundle() -> CertificateBundle {
        CertificateBundle {
            private_key: PathBuf::from("/etc/certs/live/a.example.com/privkey.pem"),
            full_chain: PathBuf::from("/etc/certs/live/a.example.com/fullchain.pem"),
            dh_params: PathBuf::from("/etc/certs/dhparam.pem"),
            fingerprint: "f00".to_string(),
            not_after: None,
        }
    }

    fn site<'a>(
        backends: &'a [String],
        hostnames: &'a BTreeSet<String>,
        certificate: &'a CertificateBundle,
        mode: LoadBalancingMode,
        auth_enabled: bool,
    ) -> SiteConfig<'a> {
        SiteConfig {
            service: "svc-a",
            backend_addresses: backends,
            load_balancing: mode,
            hostnames,
            certificate,
            auth_enabled,
        }
    }

    fn fixtures() -> (Vec<String>, BTreeSet<String>, CertificateBundle) {
        (
            vec!["10.0.0.1:8080".to_string(), "10.0.0.2:8080".to_string()],
            ["a.example.com", "www.a.example.com"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            bundle(),
        )
    }

    #[test]
    fn test_render_round_robin_without_auth() {
        let (backends, hostnames, cert) = fixtures();
        let conf = render_site(
            &site(&backends, &hostnames, &cert, LoadBalancingMode::RoundRobin, false),
            Path::new("/etc/nginx/.htpasswd/svc-a"),
        );

        assert!(conf.contains("upstream svc-a {"));
        assert!(conf.contains("    server 10.0.0.1:8080;"));
        assert!(conf.contains("    server 10.0.0.2:8080;"));
        assert!(!conf.contains("least_conn"));
        assert!(!conf.contains("ip_hash"));
        assert!(!conf.contains("auth_basic"));
        assert!(conf.contains("server_name a.example.com www.a.example.com;"));
        assert!(conf.contains("return 301 https://$host$request_uri;"));
        assert!(conf.contains("    listen 443 ssl;\n    listen [::]:443 ssl;\n    http2 on;\n"));
        assert!(!conf.contains("ssl http2"));
        assert!(conf.contains("ssl_certificate /etc/certs/live/a.example.com/fullchain.pem;"));
        assert!(conf.contains("ssl_certificate_key /etc/certs/live/a.example.com/privkey.pem;"));
        assert!(conf.contains("ssl_dhparam /etc/certs/dhparam.pem;"));
        assert!(conf.contains("proxy_pass http://svc-a;"));
    }

    #[test]
    fn test_render_modes_and_auth() {
        let (backends, hostnames, cert) = fixtures();
        let htpasswd = Path::new("/etc/nginx/.htpasswd/svc-a");

        let least = render_site(
            &site(&backends, &hostnames, &cert, LoadBalancingMode::LeastConn, true),
            htpasswd,
        );
        assert!(least.contains("    least_conn;"));
        assert!(least.contains("auth_basic \"Restricted\";"));
        assert!(least.contains("auth_basic_user_file /etc/nginx/.htpasswd/svc-a;"));

        let hash = render_site(
            &site(&backends, &hostnames, &cert, LoadBalancingMode::IpHash, false),
            htpasswd,
        );
        assert!(hash.contains("    ip_hash;"));
    }

    #[tokio::test]
    async fn test_render_and_remove_site_files() {
        let dir = tempfile::tempdir().unwrap();
        let configurer = NginxConfigurer::new(dir.path().join("sites"), dir.path().join("htpasswd"));
        let (backends, hostnames, cert) = fixtures();

        configurer
            .render(&site(&backends, &hostnames, &cert, LoadBalancingMode::RoundRobin, false))
            .await
            .unwrap();
        let path = configurer.site_path("svc-a");
        assert!(std::fs::read_to_string(&path).unwrap().contains("upstream svc-a"));

        configurer.remove("svc-a").await.unwrap();
        assert!(!path.exists());
        // Removing twice is fine
        configurer.remove("svc-a").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_validation_restores_previous_site() {
        let dir = tempfile::tempdir().unwrap();
        let (backends, hostnames, cert) = fixtures();

        let ok = NginxConfigurer::new(dir.path(), dir.path().join("htpasswd"))
            .with_validate_command(vec!["true".to_string()]);
        ok.render(&site(&backends, &hostnames, &cert, LoadBalancingMode::RoundRobin, false))
            .await
            .unwrap();
        let path = ok.site_path("svc-a");
        let before = std::fs::read_to_string(&path).unwrap();

        let failing = NginxConfigurer::new(dir.path(), dir.path().join("htpasswd"))
            .with_validate_command(vec!["false".to_string()]);
        let err = failing
            .render(&site(&backends, &hostnames, &cert, LoadBalancingMode::IpHash, true))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "config");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_validation_of_new_site_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (backends, hostnames, cert) = fixtures();

        let failing = NginxConfigurer::new(dir.path(), dir.path().join("htpasswd"))
            .with_validate_command(vec!["false".to_string()]);
        assert!(failing
            .render(&site(&backends, &hostnames, &cert, LoadBalancingMode::RoundRobin, false))
            .await
            .is_err());
        assert!(!failing.site_path("svc-a").exists());
    }

    #[tokio::test]
    async fn test_missing_command_is_config_error() {
        let err = run_command(&["/nonexistent/ssl-proxy-reload".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("`/nonexistent/ssl-proxy-reload`"));
        assert!(run_command(&[]).await.is_ok());
    }
}

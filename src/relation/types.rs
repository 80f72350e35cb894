//! Relation data declared by consumer services
//!
//! A consumer relating to the proxy publishes a [`ServiceRequirement`]: the
//! hostnames it wants terminated, the backends to forward to, how to balance
//! across them and optionally a set of basic-auth users.
//!
//! # Example relation file
//!
//! ```yaml
//! serviceName: grafana
//! hostnames: [grafana.example.com]
//! backendAddresses: ["10.0.0.4:3000", "10.0.0.5:3000"]
//! loadBalancing: least-conn
//! basicAuth:
//!   admin: s3cret
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Validation failure for a single relation field
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.how_to_fix)
    }
}

/// Join a list of validation errors into one line for logs and API replies
pub fn describe_errors(errors: &[SpecValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// How the proxy spreads requests across a service's backends
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingMode {
    /// Rotate through backends in order
    #[default]
    RoundRobin,
    /// Prefer the backend with the fewest active connections
    LeastConn,
    /// Pin each client address to one backend
    IpHash,
}

impl fmt::Display for LoadBalancingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancingMode::RoundRobin => write!(f, "round-robin"),
            LoadBalancingMode::LeastConn => write!(f, "least-conn"),
            LoadBalancingMode::IpHash => write!(f, "ip-hash"),
        }
    }
}

/// Password for a basic-auth user
///
/// Kept opaque: it is only ever handed to a credential store and folded
/// into configuration fingerprints. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BasicAuthCredential(String);

impl BasicAuthCredential {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BasicAuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BasicAuthCredential(**redacted**)")
    }
}

/// Requirements declared by one related consumer service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequirement {
    /// Unique key of the relation; also names the site and credential files
    pub service_name: String,

    /// Hostnames that must be covered by the proxy certificate, lowercased
    #[serde(deserialize_with = "deserialize_hostnames")]
    pub hostnames: BTreeSet<String>,

    /// Backend addresses (`host` or `host:port`), in the order given
    pub backend_addresses: Vec<String>,

    #[serde(default)]
    pub load_balancing: LoadBalancingMode,

    /// Basic-auth users keyed by username; empty disables auth
    #[serde(default)]
    pub basic_auth: BTreeMap<String, BasicAuthCredential>,

    #[serde(default = "Utc::now")]
    pub requested_at: DateTime<Utc>,
}

impl ServiceRequirement {
    pub fn new(
        service_name: impl Into<String>,
        hostnames: impl IntoIterator<Item = impl Into<String>>,
        backend_addresses: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            hostnames: hostnames
                .into_iter()
                .map(|host| normalize_hostname(host.into()))
                .collect(),
            backend_addresses: backend_addresses.into_iter().map(Into::into).collect(),
            load_balancing: LoadBalancingMode::default(),
            basic_auth: BTreeMap::new(),
            requested_at: Utc::now(),
        }
    }

    pub fn with_load_balancing(mut self, mode: LoadBalancingMode) -> Self {
        self.load_balancing = mode;
        self
    }

    pub fn with_basic_auth_user(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.basic_auth
            .insert(username.into(), BasicAuthCredential::new(password));
        self
    }

    pub fn auth_enabled(&self) -> bool {
        !self.basic_auth.is_empty()
    }

    /// Validate the requirement before it enters the relation store
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if !is_valid_service_name(&self.service_name) {
            errors.push(SpecValidationError::new(
                "serviceName",
                format!("invalid service name '{}'", self.service_name),
                "Use a non-empty name of letters, digits, '.', '_' or '-' that does not start with '.'.",
            ));
        }

        if self.hostnames.is_empty() {
            errors.push(SpecValidationError::new(
                "hostnames",
                "hostnames must not be empty",
                "Declare at least one hostname the proxy should terminate TLS for.",
            ));
        }
        for host in &self.hostnames {
            if !is_valid_hostname(host) {
                errors.push(SpecValidationError::new(
                    "hostnames[]",
                    format!("'{}' is not a valid DNS name", host),
                    "Use a fully qualified name such as 'app.example.com'; a single leading '*.' is allowed.",
                ));
            }
        }

        if self.backend_addresses.is_empty() {
            errors.push(SpecValidationError::new(
                "backendAddresses",
                "backendAddresses must not be empty",
                "Provide at least one backend address in 'host' or 'host:port' form.",
            ));
        }
        for addr in &self.backend_addresses {
            if addr.trim().is_empty() || addr.chars().any(|c| c.is_whitespace() || c == ';') {
                errors.push(SpecValidationError::new(
                    "backendAddresses[]",
                    format!("invalid backend address '{}'", addr),
                    "Backend addresses must be non-empty and contain no whitespace or ';'.",
                ));
            }
        }

        for (user, credential) in &self.basic_auth {
            if user.is_empty() || user.contains(':') || user.chars().any(char::is_whitespace) {
                errors.push(SpecValidationError::new(
                    "basicAuth",
                    format!("invalid basic-auth username '{}'", user),
                    "Usernames must be non-empty and contain no ':' or whitespace.",
                ));
            }
            if credential.expose().is_empty() {
                errors.push(SpecValidationError::new(
                    "basicAuth",
                    format!("empty password for user '{}'", user),
                    "Set a non-empty password for every basic-auth user.",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// DNS names are case-insensitive; one spelling per name keeps the union
/// and the certificate SANs free of duplicates
fn normalize_hostname(host: String) -> String {
    if host.bytes().any(|b| b.is_ascii_uppercase()) {
        host.to_ascii_lowercase()
    } else {
        host
    }
}

fn deserialize_hostnames<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hostnames = Vec::<String>::deserialize(deserializer)?;
    Ok(hostnames.into_iter().map(normalize_hostname).collect())
}

fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn is_valid_hostname(host: &str) -> bool {
    let host = host.strip_prefix("*.").unwrap_or(host);
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

//! Request and response bodies of the REST API

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::controller::ServicePhase;
use crate::relation::{
    BasicAuthCredential, LoadBalancingMode, ServiceRequirement, SpecValidationError,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<SpecValidationError>,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            details: Vec::new(),
        }
    }

    pub fn invalid(errors: &[SpecValidationError]) -> Self {
        Self {
            error: "invalid_relation".to_string(),
            message: format!("{} validation error(s)", errors.len()),
            details: errors.to_vec(),
        }
    }
}

/// Body of `PUT /api/v1/relations/{service}`; the service name comes from the path
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationRequest {
    pub hostnames: BTreeSet<String>,
    pub backend_addresses: Vec<String>,
    #[serde(default)]
    pub load_balancing: LoadBalancingMode,
    /// username -> password
    #[serde(default)]
    pub basic_auth: BTreeMap<String, String>,
}

impl RelationRequest {
    pub fn into_requirement(self, service: &str) -> ServiceRequirement {
        let mut requirement =
            ServiceRequirement::new(service, self.hostnames, self.backend_addresses)
                .with_load_balancing(self.load_balancing);
        requirement.basic_auth = self
            .basic_auth
            .into_iter()
            .map(|(user, password)| (user, BasicAuthCredential::new(password)))
            .collect();
        requirement
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub service: String,
    pub action: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub name: String,
    pub hostnames: BTreeSet<String>,
    pub backend_addresses: Vec<String>,
    pub load_balancing: LoadBalancingMode,
    pub auth_enabled: bool,
    /// Phase from the last finished pass; `None` until a pass has seen it
    pub phase: Option<ServicePhase>,
    pub applied: bool,
}

#[derive(Debug, Serialize)]
pub struct ServiceListResponse {
    pub items: Vec<ServiceSummary>,
    pub total: usize,
}

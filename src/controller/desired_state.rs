//! Desired proxy configuration derived from the relation store

use std::collections::{BTreeMap, BTreeSet};

use crate::relation::ServiceRequirement;

/// Target configuration merged from every active relation
///
/// Never persisted; always rebuilt from the relation store.
#[derive(Clone, Debug, Default)]
pub struct DesiredState {
    /// Exact union of hostnames across all requirements
    pub all_hostnames: BTreeSet<String>,
    pub per_service: BTreeMap<String, ServiceRequirement>,
    /// Service names in the order they were supplied
    order: Vec<String>,
}

impl DesiredState {
    /// No consumer related yet
    pub fn is_empty(&self) -> bool {
        self.all_hostnames.is_empty()
    }

    /// Requirements in input order, for deterministic processing
    pub fn services(&self) -> impl Iterator<Item = &ServiceRequirement> {
        self.order
            .iter()
            .filter_map(move |name| self.per_service.get(name))
    }

    pub fn contains_service(&self, name: &str) -> bool {
        self.per_service.contains_key(name)
    }
}

impl PartialEq for DesiredState {
    fn eq(&self, other: &Self) -> bool {
        self.all_hostnames == other.all_hostnames && self.per_service == other.per_service
    }
}

impl Eq for DesiredState {}

pub struct DesiredStateBuilder;

impl DesiredStateBuilder {
    /// Merge requirements into one desired state.
    ///
    /// Later entries with a duplicate service name replace earlier ones.
    pub fn build<'a>(
        requirements: impl IntoIterator<Item = &'a ServiceRequirement>,
    ) -> DesiredState {
        let mut state = DesiredState::default();

        for requirement in requirements {
            let name = requirement.service_name.clone();
            if state
                .per_service
                .insert(name.clone(), requirement.clone())
                .is_none()
            {
                state.order.push(name);
            }
        }

        state.all_hostnames = state
            .per_service
            .values()
            .flat_map(|r| r.hostnames.iter().cloned())
            .collect();

        state
    }
}

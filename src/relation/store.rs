//! In-memory store of related consumer services

use super::events::RelationEvent;
use super::types::ServiceRequirement;

/// Currently related consumers, kept in insertion order
#[derive(Clone, Debug, Default)]
pub struct RelationStore {
    requirements: Vec<ServiceRequirement>,
}

impl RelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a requirement or replace the one with the same service name.
    ///
    /// A replaced requirement keeps its original position.
    pub fn upsert(&mut self, requirement: ServiceRequirement) {
        match self
            .requirements
            .iter_mut()
            .find(|r| r.service_name == requirement.service_name)
        {
            Some(existing) => *existing = requirement,
            None => self.requirements.push(requirement),
        }
    }

    pub fn remove(&mut self, service_name: &str) -> Option<ServiceRequirement> {
        let pos = self
            .requirements
            .iter()
            .position(|r| r.service_name == service_name)?;
        Some(self.requirements.remove(pos))
    }

    pub fn get(&self, service_name: &str) -> Option<&ServiceRequirement> {
        self.requirements
            .iter()
            .find(|r| r.service_name == service_name)
    }

    pub fn all(&self) -> &[ServiceRequirement] {
        &self.requirements
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn apply(&mut self, event: RelationEvent) {
        match event {
            RelationEvent::Upsert(requirement) => self.upsert(requirement),
            RelationEvent::Remove(service_name) => {
                self.remove(&service_name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirement(name: &str, host: &str) -> ServiceRequirement {
        ServiceRequirement::new(name, [host], ["10.0.0.1:8080"])
    }

    #[test]
    fn test_upsert_preserves_insertion_order() {
        let mut store = RelationStore::new();
        store.upsert(requirement("b", "b.example.com"));
        store.upsert(requirement("a", "a.example.com"));
        store.upsert(requirement("c", "c.example.com"));

        let names: Vec<_> = store.all().iter().map(|r| r.service_name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut store = RelationStore::new();
        store.upsert(requirement("a", "a.example.com"));
        store.upsert(requirement("b", "b.example.com"));
        store.upsert(requirement("a", "new.example.com"));

        assert_eq!(store.len(), 2);
        assert_eq!(store.all()[0].service_name, "a");
        assert!(store.all()[0].hostnames.contains("new.example.com"));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut store = RelationStore::new();
        let req = requirement("a", "a.example.com");
        store.upsert(req.clone());
        store.upsert(req.clone());
        assert_eq!(store.all(), &[req]);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut store = RelationStore::new();
        store.upsert(requirement("a", "a.example.com"));
        assert!(store.remove("missing").is_none());
        assert_eq!(store.len(), 1);

        assert!(store.remove("a").is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_apply_events() {
        let mut store = RelationStore::new();
        store.apply(RelationEvent::Upsert(requirement("a", "a.example.com")));
        assert!(store.get("a").is_some());
        store.apply(RelationEvent::Remove("a".to_string()));
        assert!(store.get("a").is_none());
    }
}

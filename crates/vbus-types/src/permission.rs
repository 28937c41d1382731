//! Subscribe/publish grants of a bus identity.

use serde::{Deserialize, Serialize};

/// Subject patterns a principal may subscribe to and publish on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub subscribe: Vec<String>,
    #[serde(default)]
    pub publish: Vec<String>,
}

impl Permissions {
    /// Default grants for a service: itself and all of its descendants.
    pub fn for_service(id: &str) -> Self {
        let seed = vec![format!("{id}.>"), id.to_string()];
        Self {
            subscribe: seed.clone(),
            publish: seed,
        }
    }

    /// Whether `permission` is already recorded.
    ///
    /// Grants are always added to both lists, so the subscribe list is
    /// authoritative.
    pub fn contains(&self, permission: &str) -> bool {
        self.subscribe.iter().any(|p| p == permission)
    }

    /// Add `permission` to both lists. Returns false if it was already there.
    pub fn grant(&mut self, permission: &str) -> bool {
        if self.contains(permission) {
            return false;
        }
        self.subscribe.push(permission.to_string());
        if !self.publish.iter().any(|p| p == permission) {
            self.publish.push(permission.to_string());
        }
        true
    }

    /// A copy of these grants with `permission` added.
    pub fn with_grant(&self, permission: &str) -> Self {
        let mut next = self.clone();
        next.grant(permission);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_service_seeds_both_lists() {
        let p = Permissions::for_service("system.zigbee.hub1");
        assert_eq!(p.subscribe, vec!["system.zigbee.hub1.>", "system.zigbee.hub1"]);
        assert_eq!(p.subscribe, p.publish);
        assert!(p.contains("system.zigbee.hub1"));
        assert!(!p.contains("system.other"));
    }

    #[test]
    fn test_grant_is_idempotent() {
        let mut p = Permissions::for_service("a");
        assert!(p.grant("b.>"));
        assert!(!p.grant("b.>"));
        assert_eq!(p.subscribe.len(), 3);
        assert_eq!(p.publish.len(), 3);
    }

    #[test]
    fn test_with_grant_leaves_original() {
        let p = Permissions::for_service("a");
        let q = p.with_grant("c");
        assert!(!p.contains("c"));
        assert!(q.contains("c"));
    }

    #[test]
    fn test_wire_shape() {
        let p = Permissions::for_service("a");
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"subscribe": ["a.>", "a"], "publish": ["a.>", "a"]})
        );
    }
}

//! Service key, backend address and backend set definitions.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::define_addr;

// =============================================================================
// Addresses
// =============================================================================

define_addr!(ServiceKey, "service key");
define_addr!(BackendAddress, "backend address");

// =============================================================================
// Backend Set
// =============================================================================

/// Set of backend addresses believed live for one service.
///
/// An empty set means "service exists, no ready backends" and is a valid
/// state on its own. Iteration is in ascending address order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendSet(BTreeSet<BackendAddress>);

impl BackendSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Adds an address. Returns true if it was not already present.
    pub fn insert(&mut self, addr: BackendAddress) -> bool {
        self.0.insert(addr)
    }

    /// Removes an address. Returns true if it was present.
    pub fn remove(&mut self, addr: &BackendAddress) -> bool {
        self.0.remove(addr)
    }

    pub fn contains(&self, addr: &BackendAddress) -> bool {
        self.0.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &BackendAddress> + '_ {
        self.0.iter()
    }

    /// Addresses in `self` that are not in `other`, ascending.
    #[must_use]
    pub fn missing_from(&self, other: &BackendSet) -> Vec<BackendAddress> {
        self.0.difference(&other.0).copied().collect()
    }

    /// Returns true if the two sets share at least one address.
    pub fn overlaps(&self, other: &BackendSet) -> bool {
        self.0.intersection(&other.0).next().is_some()
    }
}

impl FromIterator<BackendAddress> for BackendSet {
    fn from_iter<I: IntoIterator<Item = BackendAddress>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for BackendSet {
    type Item = BackendAddress;
    type IntoIter = std::collections::btree_set::IntoIter<BackendAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a BackendSet {
    type Item = &'a BackendAddress;
    type IntoIter = std::collections::btree_set::Iter<'a, BackendAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl std::fmt::Display for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, addr) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{addr}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AddrError;
    use proptest::prelude::*;

    fn backends(addrs: &[&str]) -> BackendSet {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn test_service_key_parse_and_display() {
        let key: ServiceKey = "10.96.0.10".parse().unwrap();
        assert_eq!(key.to_string(), "10.96.0.10");
        assert_eq!(key.as_u32(), 0x0a60_000a);
    }

    #[test]
    fn test_wire_is_network_order() {
        let key: ServiceKey = "10.8.43.7".parse().unwrap();
        assert_eq!(key.to_wire(), [10, 8, 43, 7]);
        assert_eq!(ServiceKey::from_wire([10, 8, 43, 7]), key);
    }

    #[test]
    fn test_parse_empty() {
        let result: Result<BackendAddress, _> = "  ".parse();
        assert!(matches!(result, Err(AddrError::Empty { .. })));
    }

    #[test]
    fn test_parse_rejects_ipv6_and_garbage() {
        for input in ["fd00::1", "10.0.0", "10.0.0.256", "pod-a"] {
            let result: Result<BackendAddress, _> = input.parse();
            assert!(
                matches!(result, Err(crate::AddrError::NotIpv4 { .. })),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_json_uses_dotted_quad() {
        let addr: BackendAddress = "192.168.1.20".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"192.168.1.20\"");
        let parsed: BackendAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_backend_set_iterates_ascending() {
        let set = backends(&["10.0.0.9", "10.0.0.1", "9.255.255.255", "10.0.0.1"]);
        let ordered: Vec<String> = set.iter().map(ToString::to_string).collect();
        assert_eq!(ordered, vec!["9.255.255.255", "10.0.0.1", "10.0.0.9"]);
        assert_eq!(set.to_string(), "{9.255.255.255,10.0.0.1,10.0.0.9}");
    }

    #[test]
    fn test_backend_set_difference_and_overlap() {
        let desired = backends(&["10.0.0.2", "10.0.0.3"]);
        let applied = backends(&["10.0.0.1", "10.0.0.2"]);

        assert_eq!(desired.missing_from(&applied), vec!["10.0.0.3".parse().unwrap()]);
        assert_eq!(applied.missing_from(&desired), vec!["10.0.0.1".parse().unwrap()]);
        assert!(desired.overlaps(&applied));
        assert!(!desired.overlaps(&backends(&["10.0.0.1"])));
    }

    proptest! {
        #[test]
        fn prop_ordering_matches_numeric(a in any::<u32>(), b in any::<u32>()) {
            let (ka, kb) = (ServiceKey::from_u32(a), ServiceKey::from_u32(b));
            prop_assert_eq!(ka.cmp(&kb), a.cmp(&b));
            prop_assert_eq!(ka.to_string().parse::<ServiceKey>().unwrap(), ka);
        }
    }
}

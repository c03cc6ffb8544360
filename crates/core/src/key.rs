//! Primary keys and derived resource identifiers.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::KeyError;

/// `namespace/name` (or bare `name` for cluster-scoped objects).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(String);

impl PrimaryKey {
    pub fn new(raw: impl Into<String>) -> Self { Self(raw.into()) }

    pub fn from_parts(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Split into `(namespace, name)`, rejecting keys that could not have
    /// come from a well-formed object.
    pub fn split(&self) -> Result<(Option<&str>, &str), KeyError> {
        if self.0.is_empty() { return Err(KeyError::Empty); }
        let parts: Vec<&str> = self.0.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok((None, name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok((Some(ns), name)),
            _ => Err(KeyError::Malformed(self.0.clone())),
        }
    }
}

impl std::fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for PrimaryKey {
    fn from(s: &str) -> Self { Self::new(s) }
}

impl From<String> for PrimaryKey {
    fn from(s: String) -> Self { Self(s) }
}

/// Lowercase hex SHA-256 of a primary key; usable as a resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DerivedKey(String);

pub const DERIVED_KEY_LEN: usize = 64;

impl DerivedKey {
    pub fn for_primary(key: &PrimaryKey) -> Result<Self, KeyError> {
        key.split()?;
        let digest = Sha256::digest(key.as_str().as_bytes());
        Ok(Self(hex::encode(digest)))
    }

    /// Wrap an identifier read back from the store. No hashing is applied.
    pub fn from_stored(raw: impl Into<String>) -> Self { Self(raw.into()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let k = PrimaryKey::from("default/pod-a");
        let a = DerivedKey::for_primary(&k).unwrap();
        let b = DerivedKey::for_primary(&k.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), DERIVED_KEY_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn derivation_matches_known_digest() {
        // sha256("abc")
        let d = DerivedKey::for_primary(&PrimaryKey::from("abc")).unwrap();
        assert_eq!(d.as_str(), "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }

    #[test]
    fn distinct_keys_get_distinct_ids() {
        let a = DerivedKey::for_primary(&PrimaryKey::from("default/pod-a")).unwrap();
        let b = DerivedKey::for_primary(&PrimaryKey::from("default/pod-b")).unwrap();
        let c = DerivedKey::for_primary(&PrimaryKey::from("other/pod-a")).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(matches!(DerivedKey::for_primary(&PrimaryKey::from("")), Err(KeyError::Empty)));
        for bad in ["/", "ns/", "/name", "a/b/c"] {
            assert!(matches!(DerivedKey::for_primary(&PrimaryKey::from(bad)), Err(KeyError::Malformed(_))), "{bad}");
        }
    }

    #[test]
    fn from_parts_handles_cluster_scope() {
        assert_eq!(PrimaryKey::from_parts(Some("default"), "pod-a").as_str(), "default/pod-a");
        assert_eq!(PrimaryKey::from_parts(None, "node-1").as_str(), "node-1");
        assert_eq!(PrimaryKey::from_parts(Some(""), "node-1").as_str(), "node-1");
        let k = PrimaryKey::from("default/pod-a");
        assert_eq!(k.split().unwrap(), (Some("default"), "pod-a"));
    }
}

use rampart_core::ResourceKey;

/// Key under which the store revision counter lives
pub const REVISION_KEY: &str = "_meta/revision";

/// Key encoder for storage keys
pub struct KeyEncoder;

impl KeyEncoder {
    /// Encode a resource key: {kind}/{namespace}/{name}
    /// For cluster-scoped: {kind}/{name}
    pub fn encode_resource_key(key: &ResourceKey) -> String {
        key.storage_key()
    }

    /// Encode a prefix for scanning objects of a kind, optionally in one namespace
    pub fn encode_prefix(kind: &str, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) => format!("{}/{}/", kind, ns),
            None => format!("{}/", kind),
        }
    }

    /// Parse a storage key back to (kind, namespace, name)
    pub fn parse_key(key: &str) -> Option<(String, Option<String>, String)> {
        let parts: Vec<&str> = key.split('/').collect();

        match parts.as_slice() {
            [kind, name] => Some((kind.to_string(), None, name.to_string())),
            [kind, namespace, name] => Some((
                kind.to_string(),
                Some(namespace.to_string()),
                name.to_string(),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::GroupVersionKind;

    #[test]
    fn test_encode_resource_key() {
        let key = ResourceKey::new(GroupVersionKind::rampart("Workload"), "team-a", "job-1");
        assert_eq!(KeyEncoder::encode_resource_key(&key), "Workload/team-a/job-1");

        let key = ResourceKey::cluster_scoped(GroupVersionKind::rampart("ClusterQueue"), "cq");
        assert_eq!(KeyEncoder::encode_resource_key(&key), "ClusterQueue/cq");
    }

    #[test]
    fn test_encode_prefix() {
        assert_eq!(
            KeyEncoder::encode_prefix("Workload", Some("team-a")),
            "Workload/team-a/"
        );
        assert_eq!(KeyEncoder::encode_prefix("ClusterQueue", None), "ClusterQueue/");
    }

    #[test]
    fn test_parse_key() {
        let (kind, namespace, name) = KeyEncoder::parse_key("Workload/team-a/job-1").unwrap();
        assert_eq!(kind, "Workload");
        assert_eq!(namespace, Some("team-a".to_string()));
        assert_eq!(name, "job-1");

        let (kind, namespace, name) = KeyEncoder::parse_key("ClusterQueue/cq").unwrap();
        assert_eq!(kind, "ClusterQueue");
        assert_eq!(namespace, None);
        assert_eq!(name, "cq");

        assert!(KeyEncoder::parse_key("a/b/c/d").is_none());
    }
}

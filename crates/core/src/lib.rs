//! kexp core types: the resource catalog, dynamic documents, object
//! identity, cache keys, and the watch event model.
//!
//! Documents are plain `serde_json::Value` trees; the remote API's objects
//! are heterogeneous and evolve independently of this engine, so no static
//! schema is imposed. Field access goes through the [`path`] helpers.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod sort;
pub mod timefmt;

pub use sort::{SortField, Sorter};

/// Sentinel namespace meaning "union of all namespaces" in queries.
pub const ALL_NAMESPACES: &str = "*ALL*";

/// Static descriptor of a served resource collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceKind {
    /// Collection identifier as it appears in API paths, e.g. "pods".
    pub name: String,
    /// Short alias accepted on the CLI, e.g. "po".
    pub short_name: String,
    /// Menu grouping carried over from the resource catalog.
    pub category: String,
    /// API group/version path segment, e.g. "api/v1" or "apis/apps/v1".
    pub api_prefix: String,
    pub namespaced: bool,
    pub watchable: bool,
}

impl ResourceKind {
    fn new(
        name: &str,
        short_name: &str,
        category: &str,
        api_prefix: &str,
        namespaced: bool,
        watchable: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            short_name: short_name.to_string(),
            category: category.to_string(),
            api_prefix: api_prefix.to_string(),
            namespaced,
            watchable,
        }
    }
}

const CAT_CLUSTER: &str = "cluster/metadata";
const CAT_WORKLOADS: &str = "workloads";
const CAT_CONFIG: &str = "config/storage/discovery/loadbalancing";

/// Fixed catalog of resource kinds, loaded once at startup and never
/// mutated at runtime.
pub fn catalog() -> Vec<ResourceKind> {
    vec![
        ResourceKind::new("nodes", "no", CAT_CLUSTER, "api/v1", false, true),
        ResourceKind::new("namespaces", "ns", CAT_CLUSTER, "api/v1", false, true),
        ResourceKind::new("events", "ev", CAT_CLUSTER, "api/v1", true, true),
        ResourceKind::new("serviceaccounts", "sa", CAT_CLUSTER, "api/v1", true, true),
        ResourceKind::new("resourcequotas", "quota", CAT_CLUSTER, "api/v1", true, true),
        ResourceKind::new("componentstatuses", "cs", CAT_CLUSTER, "api/v1", false, false),
        ResourceKind::new("persistentvolumes", "pv", CAT_CLUSTER, "api/v1", false, true),
        ResourceKind::new("pods", "po", CAT_WORKLOADS, "api/v1", true, true),
        ResourceKind::new("replicationcontrollers", "rc", CAT_WORKLOADS, "api/v1", true, true),
        ResourceKind::new("deployments", "deploy", CAT_WORKLOADS, "apis/apps/v1", true, true),
        ResourceKind::new("replicasets", "rs", CAT_WORKLOADS, "apis/apps/v1", true, true),
        ResourceKind::new("daemonsets", "ds", CAT_WORKLOADS, "apis/apps/v1", true, true),
        ResourceKind::new("statefulsets", "sts", CAT_WORKLOADS, "apis/apps/v1", true, true),
        ResourceKind::new("jobs", "jobs", CAT_WORKLOADS, "apis/batch/v1", true, true),
        ResourceKind::new("services", "svc", CAT_CONFIG, "api/v1", true, true),
        ResourceKind::new("endpoints", "ep", CAT_CONFIG, "api/v1", true, true),
        ResourceKind::new("configmaps", "cm", CAT_CONFIG, "api/v1", true, true),
        ResourceKind::new("secrets", "secrets", CAT_CONFIG, "api/v1", true, true),
        ResourceKind::new("persistentvolumeclaims", "pvc", CAT_CONFIG, "api/v1", true, true),
        ResourceKind::new("ingresses", "ing", CAT_CONFIG, "apis/networking.k8s.io/v1", true, true),
        ResourceKind::new(
            "horizontalpodautoscalers",
            "hpa",
            CAT_CLUSTER,
            "apis/autoscaling/v2",
            true,
            true,
        ),
    ]
}

/// Look up a kind by its collection name or short alias.
pub fn find_kind(kinds: &[ResourceKind], name: &str) -> Option<ResourceKind> {
    kinds
        .iter()
        .find(|k| k.name == name || k.short_name == name)
        .cloned()
}

/// Identifies one cached collection slice: a kind plus the namespace the
/// watch was scoped to (empty for cluster-scoped or cluster-wide watches).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: String,
    pub namespace: String,
}

impl CacheKey {
    pub fn new(kind: &str, namespace: Option<&str>) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.unwrap_or("").to_string(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}@{}", self.kind, self.namespace)
        }
    }
}

/// Identity of one object within a collection: (namespace, name) read from
/// `metadata`. Cluster-scoped objects carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn of(obj: &Value) -> Self {
        Self {
            namespace: path::str_at(obj, &["metadata", "namespace"])
                .unwrap_or_default()
                .to_string(),
            name: path::str_at(obj, &["metadata", "name"])
                .unwrap_or_default()
                .to_string(),
        }
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Path-based access into dynamic documents.
pub mod path {
    use serde_json::Value;

    /// Walk nested mappings by key; `None` when any step is missing.
    pub fn get<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Value> {
        let mut cur = v;
        for key in path {
            cur = cur.get(key)?;
        }
        Some(cur)
    }

    pub fn str_at<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
        get(v, path).and_then(Value::as_str)
    }

    pub fn i64_at(v: &Value, path: &[&str]) -> Option<i64> {
        get(v, path).and_then(Value::as_i64)
    }
}

/// Kind of an incremental change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// One decoded change event from a watch stream.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub object: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("malformed watch event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown watch event type '{0}'")]
    UnknownType(String),
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    object: Value,
}

impl WatchEvent {
    pub fn added(object: Value) -> Self {
        Self { kind: EventKind::Added, object }
    }

    pub fn modified(object: Value) -> Self {
        Self { kind: EventKind::Modified, object }
    }

    pub fn deleted(object: Value) -> Self {
        Self { kind: EventKind::Deleted, object }
    }

    /// Decode one newline-delimited JSON line from a watch stream.
    pub fn parse(line: &str) -> Result<Self, EventError> {
        let raw: RawEvent = serde_json::from_str(line)?;
        let kind = match raw.kind.as_str() {
            "ADDED" => EventKind::Added,
            "MODIFIED" => EventKind::Modified,
            "DELETED" => EventKind::Deleted,
            other => return Err(EventError::UnknownType(other.to_string())),
        };
        Ok(Self { kind, object: raw.object })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn catalog_has_unique_names_and_known_kinds() {
        let kinds = catalog();
        let mut names: Vec<_> = kinds.iter().map(|k| k.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), kinds.len());
        assert!(find_kind(&kinds, "pods").is_some());
        assert!(find_kind(&kinds, "po").is_some());
        assert!(find_kind(&kinds, "flux-capacitors").is_none());
    }

    #[test]
    fn cluster_scoped_kinds_are_flagged() {
        let kinds = catalog();
        let nodes = find_kind(&kinds, "nodes").unwrap();
        assert!(!nodes.namespaced);
        assert!(nodes.watchable);
        let cs = find_kind(&kinds, "componentstatuses").unwrap();
        assert!(!cs.watchable);
    }

    #[test]
    fn object_id_reads_metadata() {
        let obj = json!({"metadata": {"name": "web-1", "namespace": "default"}});
        let id = ObjectId::of(&obj);
        assert_eq!(id.name, "web-1");
        assert_eq!(id.namespace, "default");
        assert_eq!(id.to_string(), "default/web-1");
    }

    #[test]
    fn object_id_tolerates_missing_fields() {
        let id = ObjectId::of(&json!({}));
        assert_eq!(id.name, "");
        assert_eq!(id.namespace, "");
    }

    #[test]
    fn path_helpers_walk_nested_maps() {
        let obj = json!({"status": {"nodeInfo": {"kubeletVersion": "v1.29.0"}, "replicas": 3}});
        assert_eq!(
            path::str_at(&obj, &["status", "nodeInfo", "kubeletVersion"]),
            Some("v1.29.0")
        );
        assert_eq!(path::i64_at(&obj, &["status", "replicas"]), Some(3));
        assert!(path::get(&obj, &["spec", "anything"]).is_none());
    }

    #[test]
    fn watch_event_parses_known_types() {
        let ev = WatchEvent::parse(r#"{"type":"ADDED","object":{"metadata":{"name":"a"}}}"#)
            .unwrap();
        assert_eq!(ev.kind, EventKind::Added);
        assert_eq!(ObjectId::of(&ev.object).name, "a");
    }

    #[test]
    fn watch_event_rejects_unknown_type() {
        let err = WatchEvent::parse(r#"{"type":"BOOKMARK","object":{}}"#).unwrap_err();
        assert!(matches!(err, EventError::UnknownType(ref t) if t == "BOOKMARK"));
    }

    #[test]
    fn watch_event_rejects_garbage() {
        assert!(matches!(
            WatchEvent::parse("not json at all"),
            Err(EventError::Malformed(_))
        ));
    }

    #[test]
    fn cache_key_display() {
        assert_eq!(CacheKey::new("pods", Some("default")).to_string(), "pods@default");
        assert_eq!(CacheKey::new("nodes", None).to_string(), "nodes");
    }
}

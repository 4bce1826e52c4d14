//! kexp in-RAM resource repository.
//!
//! A keyed store mapping each (kind, namespace) slice to its current
//! objects, mutated only through watch event application (or wholesale
//! slice replacement for kinds without a watch endpoint). All access is
//! serialized behind one RwLock; reads hand out snapshots, never live
//! references. The Go original mutated this map with no synchronization at
//! all, which was a latent data race; here the lock is the contract.

#![forbid(unsafe_code)]

use std::sync::RwLock;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tracing::{debug, warn};

use kexp_core::sort::{SortField, Sorter};
use kexp_core::{path, CacheKey, EventKind, ObjectId, ResourceKind, WatchEvent, ALL_NAMESPACES};

mod notify;

pub use notify::{Notice, Notifier};

#[derive(Default)]
pub struct Repository {
    slices: RwLock<FxHashMap<CacheKey, Vec<Value>>>,
    sorter: RwLock<Sorter>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one change event to a slice. Returns true when the cache was
    /// mutated. ADDED for an existing identity is treated as an upsert;
    /// MODIFIED/DELETED for a missing identity are warned and skipped.
    pub fn apply(&self, key: &CacheKey, event: WatchEvent) -> bool {
        let id = ObjectId::of(&event.object);
        let mut slices = self.slices.write().unwrap_or_else(|e| e.into_inner());
        let slice = slices.entry(key.clone()).or_default();
        let pos = slice.iter().position(|o| ObjectId::of(o) == id);
        let applied = match (event.kind, pos) {
            (EventKind::Added, None) => {
                slice.push(event.object);
                true
            }
            (EventKind::Added, Some(i)) => {
                // Watch replays can re-announce known objects.
                debug!(%key, object = %id, "duplicate ADDED treated as upsert");
                slice[i] = event.object;
                true
            }
            (EventKind::Modified, Some(i)) => {
                slice[i] = event.object;
                true
            }
            (EventKind::Modified, None) => {
                warn!(%key, object = %id, "MODIFIED for unknown object; ignoring");
                false
            }
            (EventKind::Deleted, Some(i)) => {
                slice.remove(i);
                true
            }
            (EventKind::Deleted, None) => {
                warn!(%key, object = %id, "DELETED for unknown object; ignoring");
                false
            }
        };
        if applied {
            counter!("kexp_store_events_applied_total", 1);
        } else {
            counter!("kexp_store_events_ignored_total", 1);
        }
        applied
    }

    /// Snapshot of all items for a kind, filtered to `namespace` unless it
    /// is the all-namespaces sentinel or the kind is cluster-scoped, sorted
    /// by the active strategy. Slices with overlapping scopes (a cluster-wide
    /// watch next to a namespaced one) can hold the same object twice, so the
    /// merge keeps only the first occurrence of each identity.
    pub fn items(&self, kind: &ResourceKind, namespace: &str) -> Vec<Value> {
        let slices = self.slices.read().unwrap_or_else(|e| e.into_inner());
        let mut seen: FxHashSet<ObjectId> = FxHashSet::default();
        let mut out: Vec<Value> = Vec::new();
        for slice in slices
            .iter()
            .filter(|(key, _)| key.kind == kind.name)
            .map(|(_, slice)| slice)
        {
            for obj in slice {
                if seen.insert(ObjectId::of(obj)) {
                    out.push(obj.clone());
                }
            }
        }
        drop(slices);
        if kind.namespaced && namespace != ALL_NAMESPACES {
            out.retain(|o| {
                path::str_at(o, &["metadata", "namespace"]).unwrap_or("") == namespace
            });
        }
        let sorter = *self.sorter.read().unwrap_or_else(|e| e.into_inner());
        sorter.sort(&mut out);
        out
    }

    /// Point lookup by identity. Under the all-namespaces sentinel the
    /// first name match in any namespace wins.
    pub fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        let any_ns = !kind.namespaced || namespace == ALL_NAMESPACES;
        let slices = self.slices.read().unwrap_or_else(|e| e.into_inner());
        slices
            .iter()
            .filter(|(key, _)| key.kind == kind.name)
            .flat_map(|(_, slice)| slice.iter())
            .find(|o| {
                let id = ObjectId::of(o);
                id.name == name && (any_ns || id.namespace == namespace)
            })
            .cloned()
    }

    /// Substitute a whole slice; used for kinds without a watch endpoint,
    /// where a synchronous list fetch stands in for event application.
    pub fn replace(&self, key: &CacheKey, items: Vec<Value>) {
        let mut slices = self.slices.write().unwrap_or_else(|e| e.into_inner());
        slices.insert(key.clone(), items);
    }

    /// Drop one slice (e.g. after a delete on a non-watched kind, forcing a
    /// refetch on next query).
    pub fn drop_slice(&self, key: &CacheKey) {
        let mut slices = self.slices.write().unwrap_or_else(|e| e.into_inner());
        slices.remove(key);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        let slices = self.slices.read().unwrap_or_else(|e| e.into_inner());
        slices.contains_key(key)
    }

    /// Forget everything; the cache is a disposable mirror, rebuilt on
    /// every context switch.
    pub fn clear(&self) {
        let mut slices = self.slices.write().unwrap_or_else(|e| e.into_inner());
        slices.clear();
    }

    pub fn sorter(&self) -> Sorter {
        *self.sorter.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Select the sort field; re-selecting the active field flips
    /// direction.
    pub fn set_sort_field(&self, field: SortField) {
        self.sorter.write().unwrap_or_else(|e| e.into_inner()).select(field);
    }

    pub fn toggle_sort_direction(&self) {
        self.sorter.write().unwrap_or_else(|e| e.into_inner()).toggle_direction();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn pods() -> ResourceKind {
        kexp_core::find_kind(&kexp_core::catalog(), "pods").unwrap()
    }

    fn nodes() -> ResourceKind {
        kexp_core::find_kind(&kexp_core::catalog(), "nodes").unwrap()
    }

    fn pod(ns: &str, name: &str) -> Value {
        json!({"metadata": {"name": name, "namespace": ns}, "status": {"phase": "Running"}})
    }

    fn key(ns: &str) -> CacheKey {
        CacheKey::new("pods", Some(ns))
    }

    #[test]
    fn added_then_queried() {
        let repo = Repository::new();
        repo.apply(&key("default"), WatchEvent::added(pod("default", "a")));
        let items = repo.items(&pods(), "default");
        assert_eq!(items.len(), 1);
        assert_eq!(ObjectId::of(&items[0]).name, "a");
    }

    #[test]
    fn modified_replaces_in_place() {
        let repo = Repository::new();
        repo.apply(&key("default"), WatchEvent::added(pod("default", "a")));
        let mut changed = pod("default", "a");
        changed["status"]["phase"] = json!("Failed");
        repo.apply(&key("default"), WatchEvent::modified(changed));
        let items = repo.items(&pods(), "default");
        assert_eq!(items.len(), 1);
        assert_eq!(path::str_at(&items[0], &["status", "phase"]), Some("Failed"));
    }

    #[test]
    fn duplicate_added_upserts_without_duplicating() {
        let repo = Repository::new();
        repo.apply(&key("default"), WatchEvent::added(pod("default", "a")));
        let mut again = pod("default", "a");
        again["status"]["phase"] = json!("Pending");
        assert!(repo.apply(&key("default"), WatchEvent::added(again)));
        let items = repo.items(&pods(), "default");
        assert_eq!(items.len(), 1);
        assert_eq!(path::str_at(&items[0], &["status", "phase"]), Some("Pending"));
    }

    #[test]
    fn overlapping_slices_do_not_duplicate_identities() {
        let repo = Repository::new();
        // A cluster-wide watch and a namespaced watch both deliver the pod.
        repo.apply(
            &CacheKey::new("pods", None),
            WatchEvent::added(pod("default", "a")),
        );
        repo.apply(&key("default"), WatchEvent::added(pod("default", "a")));
        assert_eq!(repo.items(&pods(), "default").len(), 1);
        assert_eq!(repo.items(&pods(), ALL_NAMESPACES).len(), 1);
    }

    #[test]
    fn modified_for_unknown_object_is_a_noop() {
        let repo = Repository::new();
        repo.apply(&key("default"), WatchEvent::added(pod("default", "a")));
        assert!(!repo.apply(&key("default"), WatchEvent::modified(pod("default", "ghost"))));
        assert_eq!(repo.items(&pods(), "default").len(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let repo = Repository::new();
        repo.apply(&key("default"), WatchEvent::added(pod("default", "a")));
        assert!(repo.apply(&key("default"), WatchEvent::deleted(pod("default", "a"))));
        assert!(!repo.apply(&key("default"), WatchEvent::deleted(pod("default", "a"))));
        assert!(repo.items(&pods(), "default").is_empty());
    }

    #[test]
    fn identities_stay_unique_under_event_mix() {
        let repo = Repository::new();
        let k = key("default");
        repo.apply(&k, WatchEvent::added(pod("default", "a")));
        repo.apply(&k, WatchEvent::added(pod("default", "b")));
        repo.apply(&k, WatchEvent::added(pod("default", "a")));
        repo.apply(&k, WatchEvent::modified(pod("default", "b")));
        repo.apply(&k, WatchEvent::deleted(pod("default", "missing")));
        let items = repo.items(&pods(), "default");
        let mut ids: Vec<_> = items.iter().map(ObjectId::of).collect();
        let before = ids.len();
        ids.dedup();
        assert_eq!(before, ids.len());
        assert_eq!(before, 2);
    }

    #[test]
    fn namespace_filter_and_all_sentinel() {
        let repo = Repository::new();
        repo.apply(&key("default"), WatchEvent::added(pod("default", "a")));
        repo.apply(&key("kube-system"), WatchEvent::added(pod("kube-system", "b")));
        assert_eq!(repo.items(&pods(), "default").len(), 1);
        assert_eq!(repo.items(&pods(), "kube-system").len(), 1);
        assert_eq!(repo.items(&pods(), ALL_NAMESPACES).len(), 2);
        assert!(repo.items(&pods(), "empty-ns").is_empty());
    }

    #[test]
    fn cluster_scoped_kind_ignores_namespace_argument() {
        let repo = Repository::new();
        let k = CacheKey::new("nodes", None);
        repo.apply(&k, WatchEvent::added(json!({"metadata": {"name": "node-1"}})));
        assert_eq!(repo.items(&nodes(), "default").len(), 1);
        assert!(repo.get(&nodes(), "anything", "node-1").is_some());
    }

    #[test]
    fn query_results_follow_active_sorter() {
        let repo = Repository::new();
        let k = key("default");
        repo.apply(&k, WatchEvent::added(pod("default", "b")));
        repo.apply(&k, WatchEvent::added(pod("default", "a")));
        let names: Vec<_> =
            repo.items(&pods(), "default").iter().map(|o| ObjectId::of(o).name).collect();
        assert_eq!(names, ["a", "b"]);
        repo.toggle_sort_direction();
        let names: Vec<_> =
            repo.items(&pods(), "default").iter().map(|o| ObjectId::of(o).name).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn replace_substitutes_for_unwatched_kinds() {
        let repo = Repository::new();
        let k = CacheKey::new("componentstatuses", None);
        repo.replace(&k, vec![json!({"metadata": {"name": "scheduler"}})]);
        assert!(repo.contains(&k));
        repo.drop_slice(&k);
        assert!(!repo.contains(&k));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_workers_lose_no_updates() {
        let repo = Arc::new(Repository::new());
        let mut tasks = Vec::new();
        for (kind, ns) in [("pods", "default"), ("services", "default")] {
            let repo = Arc::clone(&repo);
            tasks.push(tokio::spawn(async move {
                let key = CacheKey::new(kind, Some(ns));
                for i in 0..200 {
                    let obj = json!({"metadata": {"name": format!("{kind}-{i}"), "namespace": ns}});
                    repo.apply(&key, WatchEvent::added(obj));
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(repo.items(&pods(), "default").len(), 200);
        let svc = kexp_core::find_kind(&kexp_core::catalog(), "services").unwrap();
        assert_eq!(repo.items(&svc, "default").len(), 200);
    }
}

//! kexp watch stream supervisor.
//!
//! One tokio task per open stream reads newline-delimited change events
//! and applies them to the repository. Closing a stream means cancelling
//! its worker, which drops the in-flight response and with it the
//! connection; the blocked read then ends and the worker exits. There is
//! no ordering guarantee across different streams, only within one.

#![forbid(unsafe_code)]

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use kexp_client::{ClientError, RestClient};
use kexp_core::{CacheKey, EventError, ResourceKind, WatchEvent};
use kexp_store::{Notifier, Repository};

mod monitor;

pub use monitor::{spawn_monitor, MonitorHandle};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watch already open for {0}")]
    Duplicate(CacheKey),
    #[error("kind '{0}' has no watch endpoint")]
    NotWatchable(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}

struct Handle {
    online: Arc<AtomicBool>,
    cancel: Option<oneshot::Sender<()>>,
}

/// Supervisor owning every open watch stream for one cluster connection.
pub struct WatchHub {
    client: Arc<RestClient>,
    repo: Arc<Repository>,
    notifier: Arc<Notifier>,
    handles: Mutex<FxHashMap<CacheKey, Handle>>,
}

impl WatchHub {
    pub fn new(client: Arc<RestClient>, repo: Arc<Repository>, notifier: Arc<Notifier>) -> Arc<Self> {
        Arc::new(Self { client, repo, notifier, handles: Mutex::new(FxHashMap::default()) })
    }

    /// Open a watch for one (kind, namespace) slice and start its worker.
    /// A second watch on the same slice is rejected; a failure to open
    /// propagates to the caller and leaves no handle behind.
    pub async fn watch(
        self: &Arc<Self>,
        kind: &ResourceKind,
        namespace: Option<&str>,
    ) -> Result<(), WatchError> {
        if !kind.watchable {
            return Err(WatchError::NotWatchable(kind.name.clone()));
        }
        let ns = if kind.namespaced { namespace } else { None };
        let key = CacheKey::new(&kind.name, ns);
        let url = kexp_client::paths::watch(self.client.server(), &kind.api_prefix, &kind.name, ns)?;

        let online = Arc::new(AtomicBool::new(false));
        {
            let mut handles = self.lock_handles();
            if handles.contains_key(&key) {
                return Err(WatchError::Duplicate(key));
            }
            // Placeholder reserves the key while the connection opens.
            handles.insert(key.clone(), Handle { online: Arc::clone(&online), cancel: None });
        }

        let resp = match self.client.open_stream(url).await {
            Ok(resp) => resp,
            Err(e) => {
                self.lock_handles().remove(&key);
                return Err(e.into());
            }
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut handles = self.lock_handles();
            match handles.get_mut(&key) {
                Some(h) => h.cancel = Some(cancel_tx),
                // Closed while the connection was opening; nothing to run.
                None => return Ok(()),
            }
            gauge!("kexp_watches_open", handles.len() as f64);
        }

        info!(%key, "watch started");
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let end = run_event_pump(
                resp.bytes_stream(),
                &key,
                &hub.repo,
                &hub.notifier,
                &online,
                cancel_rx,
            )
            .await;
            online.store(false, Ordering::Relaxed);
            match &end {
                PumpEnd::Eof => debug!(%key, "watch stream closed"),
                PumpEnd::Cancelled => debug!(%key, "watch cancelled"),
                PumpEnd::Failed(msg) => {
                    warn!(%key, error = %msg, "watch stream failed");
                    hub.notifier.warning(format!("watch on {key} failed: {msg}"));
                }
            }
            let mut handles = hub.lock_handles();
            handles.remove(&key);
            gauge!("kexp_watches_open", handles.len() as f64);
        });
        Ok(())
    }

    /// Open watches for every watchable kind in the catalog, cluster-wide.
    /// The first failure aborts and propagates.
    pub async fn watch_all(self: &Arc<Self>, kinds: &[ResourceKind]) -> Result<(), WatchError> {
        for kind in kinds.iter().filter(|k| k.watchable) {
            self.watch(kind, None).await?;
        }
        Ok(())
    }

    /// Cancel every watch whose key matches the filter, closing the
    /// underlying connections. Returns how many were closed.
    pub fn close_watches(&self, filter: impl Fn(&CacheKey) -> bool) -> usize {
        let mut handles = self.lock_handles();
        let keys: Vec<CacheKey> = handles.keys().filter(|k| filter(k)).cloned().collect();
        for key in &keys {
            if let Some(mut h) = handles.remove(key) {
                if let Some(cancel) = h.cancel.take() {
                    let _ = cancel.send(());
                }
                debug!(%key, "watch closed");
            }
        }
        gauge!("kexp_watches_open", handles.len() as f64);
        keys.len()
    }

    pub fn close_all(&self) -> usize {
        self.close_watches(|_| true)
    }

    /// Online flag of one handle; `None` when no watch is open for the key.
    pub fn online(&self, key: &CacheKey) -> Option<bool> {
        self.lock_handles().get(key).map(|h| h.online.load(Ordering::Relaxed))
    }

    pub fn open_keys(&self) -> Vec<CacheKey> {
        self.lock_handles().keys().cloned().collect()
    }

    /// Flip every open handle offline; used by the liveness monitor. The
    /// streams are left running and recover on their next delivered event.
    pub fn set_all_offline(&self) {
        for handle in self.lock_handles().values() {
            handle.online.store(false, Ordering::Relaxed);
        }
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, FxHashMap<CacheKey, Handle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// How an event pump ended.
#[derive(Debug, PartialEq, Eq)]
enum PumpEnd {
    /// Clean closure (EOF / connection closed).
    Eof,
    /// Cancelled via the handle.
    Cancelled,
    /// Unexpected read error.
    Failed(String),
}

/// Read byte chunks, split newline-delimited events, apply them.
///
/// A malformed or unknown event is logged and skipped; it never aborts the
/// stream. Each applied event flips the handle back online and notifies
/// the presentation layer.
async fn run_event_pump<S, E>(
    stream: S,
    key: &CacheKey,
    repo: &Repository,
    notifier: &Notifier,
    online: &AtomicBool,
    mut cancel_rx: oneshot::Receiver<()>,
) -> PumpEnd
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = BytesMut::new();
    loop {
        tokio::select! {
            _ = &mut cancel_rx => return PumpEnd::Cancelled,
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    buf.extend_from_slice(&chunk);
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line = buf.split_to(pos);
                        let _ = buf.split_to(1); // the '\n'
                        if let Ok(text) = std::str::from_utf8(&line) {
                            apply_line(text, key, repo, notifier, online);
                        } else {
                            warn!(%key, "non-UTF-8 watch line skipped");
                        }
                    }
                }
                Some(Err(e)) => return PumpEnd::Failed(e.to_string()),
                None => return PumpEnd::Eof,
            }
        }
    }
}

fn apply_line(line: &str, key: &CacheKey, repo: &Repository, notifier: &Notifier, online: &AtomicBool) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match WatchEvent::parse(line) {
        Ok(event) => {
            // Only a mutation counts; a MODIFIED/DELETED miss must not
            // advertise a change or mark the watch healthy.
            if repo.apply(key, event) {
                online.store(true, Ordering::Relaxed);
                notifier.changed(key);
            }
        }
        Err(EventError::UnknownType(t)) => {
            counter!("kexp_watch_events_unknown_total", 1);
            warn!(%key, event_type = %t, "unknown watch event type; ignoring");
        }
        Err(EventError::Malformed(e)) => {
            counter!("kexp_watch_lines_malformed_total", 1);
            warn!(%key, error = %e, "malformed watch line; skipping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> CacheKey {
        CacheKey::new("pods", Some("default"))
    }

    fn pods() -> ResourceKind {
        kexp_core::find_kind(&kexp_core::catalog(), "pods").unwrap()
    }

    fn event_line(ev_type: &str, name: &str) -> String {
        json!({"type": ev_type, "object": {"metadata": {"name": name, "namespace": "default"}}})
            .to_string()
            + "\n"
    }

    async fn pump_chunks(chunks: Vec<Bytes>) -> (Repository, PumpEnd) {
        let repo = Repository::new();
        let (notifier, _rx) = Notifier::channel(16);
        let online = AtomicBool::new(false);
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let stream = futures::stream::iter(
            chunks.into_iter().map(Ok::<Bytes, std::io::Error>),
        );
        let end = run_event_pump(stream, &key(), &repo, &notifier, &online, cancel_rx).await;
        (repo, end)
    }

    #[tokio::test]
    async fn applies_events_split_across_chunks() {
        let line = event_line("ADDED", "a");
        let (head, tail) = line.split_at(17);
        let (repo, end) = pump_chunks(vec![
            Bytes::from(head.to_string()),
            Bytes::from(tail.to_string()),
            Bytes::from(event_line("ADDED", "b")),
        ])
        .await;
        assert_eq!(end, PumpEnd::Eof);
        assert_eq!(repo.items(&pods(), "default").len(), 2);
    }

    #[tokio::test]
    async fn malformed_and_unknown_lines_do_not_abort() {
        let (repo, end) = pump_chunks(vec![Bytes::from(
            format!(
                "not json\n{}{}\n{}",
                event_line("BOOKMARK", "x"),
                json!({"type": "ADDED"}), // missing object
                event_line("ADDED", "survivor"),
            ),
        )])
        .await;
        assert_eq!(end, PumpEnd::Eof);
        let items = repo.items(&pods(), "default");
        assert_eq!(items.len(), 1);
        assert_eq!(kexp_core::ObjectId::of(&items[0]).name, "survivor");
    }

    #[tokio::test]
    async fn modified_and_deleted_flow_through() {
        let mut changed = json!({"type": "MODIFIED", "object": {"metadata": {"name": "a", "namespace": "default"}, "status": {"phase": "Failed"}}}).to_string();
        changed.push('\n');
        let (repo, _) = pump_chunks(vec![
            Bytes::from(event_line("ADDED", "a")),
            Bytes::from(event_line("ADDED", "b")),
            Bytes::from(changed),
            Bytes::from(event_line("DELETED", "b")),
        ])
        .await;
        let items = repo.items(&pods(), "default");
        assert_eq!(items.len(), 1);
        assert_eq!(
            kexp_core::path::str_at(&items[0], &["status", "phase"]),
            Some("Failed")
        );
    }

    #[tokio::test]
    async fn ignored_events_do_not_notify_or_mark_online() {
        let repo = Repository::new();
        let (notifier, mut notices) = Notifier::channel(16);
        let online = AtomicBool::new(false);
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        // MODIFIED and DELETED for objects the cache never held.
        let stream = futures::stream::iter(vec![Ok::<Bytes, std::io::Error>(Bytes::from(
            format!("{}{}", event_line("MODIFIED", "ghost"), event_line("DELETED", "ghost")),
        ))]);
        let end = run_event_pump(stream, &key(), &repo, &notifier, &online, cancel_rx).await;
        assert_eq!(end, PumpEnd::Eof);
        assert!(!online.load(Ordering::Relaxed));
        assert!(notices.try_recv().is_err());

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let stream = futures::stream::iter(vec![Ok::<Bytes, std::io::Error>(Bytes::from(
            event_line("ADDED", "a"),
        ))]);
        run_event_pump(stream, &key(), &repo, &notifier, &online, cancel_rx).await;
        assert!(online.load(Ordering::Relaxed));
        assert!(notices.try_recv().is_ok());
    }

    #[tokio::test]
    async fn read_error_reported_as_failure() {
        let repo = Repository::new();
        let (notifier, mut notices) = Notifier::channel(16);
        let online = AtomicBool::new(true);
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let stream = futures::stream::iter(vec![
            Ok::<Bytes, std::io::Error>(Bytes::from(event_line("ADDED", "a"))),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer")),
        ]);
        let end = run_event_pump(stream, &key(), &repo, &notifier, &online, cancel_rx).await;
        assert!(matches!(end, PumpEnd::Failed(ref m) if m.contains("reset")));
        // The event before the failure still landed and was announced.
        assert_eq!(repo.items(&pods(), "default").len(), 1);
        assert!(notices.try_recv().is_ok());
    }

    #[tokio::test]
    async fn cancel_stops_a_pending_pump() {
        let repo = Arc::new(Repository::new());
        let (notifier, _rx) = Notifier::channel(16);
        let notifier = Arc::new(notifier);
        let online = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let stream = async_stream::stream! {
            yield Ok::<Bytes, std::io::Error>(Bytes::from(event_line("ADDED", "a")));
            futures::future::pending::<()>().await;
        };
        let k = key();
        let repo2 = Arc::clone(&repo);
        let notifier2 = Arc::clone(&notifier);
        let online2 = Arc::clone(&online);
        let task = tokio::spawn(async move {
            run_event_pump(stream, &k, &repo2, &notifier2, &online2, cancel_rx).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(online.load(Ordering::Relaxed));
        cancel_tx.send(()).unwrap();
        let end = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("pump did not stop")
            .unwrap();
        assert_eq!(end, PumpEnd::Cancelled);
        assert_eq!(repo.items(&pods(), "default").len(), 1);
    }

    #[tokio::test]
    async fn events_set_handle_online() {
        let repo = Repository::new();
        let (notifier, _rx) = Notifier::channel(16);
        let online = AtomicBool::new(false);
        apply_line(event_line("ADDED", "a").trim(), &key(), &repo, &notifier, &online);
        assert!(online.load(Ordering::Relaxed));
    }
}

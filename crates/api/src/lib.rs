//! kexp engine façade.
//!
//! The one surface the presentation layer talks to: reads answered from the
//! local cache, mutations forwarded to the cluster, plus the connection
//! lifecycle (availability gate, watch fan-out, liveness monitor, teardown).
//! Switching contexts means shutting one engine down and connecting a new
//! one; nothing is shared across connections.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use kexp_client::{paths, ClientError, ClusterContext, RestClient};
use kexp_core::{path, CacheKey, ResourceKind, SortField, ALL_NAMESPACES};
use kexp_store::{Notifier, Repository};
use kexp_watch::{spawn_monitor, MonitorHandle, WatchError, WatchHub};

mod stream;

pub use kexp_store::Notice;
pub use stream::{CancelHandle, LogChunk, StreamHandle};

/// Server-side tail applied to every log read and follow.
const LOG_TAIL_LINES: u32 = 1000;
/// Cadence of the background reachability probe.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// Bound on the presentation notice queue.
const NOTICE_CAPACITY: usize = 256;
/// Bound on each log follow queue.
const LOG_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("internal: {0}")]
    Internal(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Query and command surface exposed to frontends. In-process today; the
/// trait keeps a mock or remote implementation possible.
#[async_trait::async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Current items of one kind, filtered to `namespace` (or all of them
    /// for [`ALL_NAMESPACES`]), in the active sort order.
    async fn items(&self, kind: &str, namespace: &str) -> BackendResult<Vec<Value>>;

    /// One object by name; `None` when it does not exist.
    async fn get(&self, kind: &str, namespace: &str, name: &str) -> BackendResult<Option<Value>>;

    /// Delete an object. `immediate` requests no grace period.
    async fn delete(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        immediate: bool,
    ) -> BackendResult<()>;

    /// Adjust `spec.replicas` by `delta` (never below zero) and return the
    /// new target count.
    async fn scale(&self, kind: &str, namespace: &str, name: &str, delta: i64)
        -> BackendResult<i64>;

    /// Recent log tail of one container, control bytes stripped.
    async fn read_logs(&self, namespace: &str, pod: &str, container: &str)
        -> BackendResult<String>;

    /// Follow a container's logs; the handle cancels the stream.
    async fn follow_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> BackendResult<StreamHandle<LogChunk>>;

    /// Run a command in a container and return its combined stdout.
    async fn exec_command(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> BackendResult<String>;

    /// Reachability probe against the connected cluster.
    async fn availability(&self) -> BackendResult<()>;

    fn set_sort_field(&self, field: SortField);

    fn toggle_sort_direction(&self);
}

/// In-process engine bound to one cluster connection.
pub struct Engine {
    kinds: Vec<ResourceKind>,
    client: Arc<RestClient>,
    repo: Arc<Repository>,
    notifier: Arc<Notifier>,
    hub: Arc<WatchHub>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl Engine {
    /// Connect to a cluster: probe it (an unreachable cluster aborts
    /// startup), open a cluster-wide watch per watchable kind, and start
    /// the liveness monitor. Returns the engine and the notice stream the
    /// presentation layer drains.
    pub async fn connect(ctx: ClusterContext) -> BackendResult<(Arc<Self>, mpsc::Receiver<Notice>)> {
        let name = ctx.name.clone();
        let client = Arc::new(RestClient::new(ctx)?);
        client.probe().await?;
        info!(context = %name, "cluster reachable; connecting");

        let repo = Arc::new(Repository::new());
        let (notifier, notices) = Notifier::channel(NOTICE_CAPACITY);
        let notifier = Arc::new(notifier);
        let hub = WatchHub::new(Arc::clone(&client), Arc::clone(&repo), Arc::clone(&notifier));

        let kinds = kexp_core::catalog();
        hub.watch_all(&kinds).await?;
        let monitor = spawn_monitor(
            Arc::clone(&client),
            Arc::clone(&hub),
            Arc::clone(&notifier),
            PROBE_INTERVAL,
        );

        let engine = Arc::new(Self {
            kinds,
            client,
            repo,
            notifier,
            hub,
            monitor: Mutex::new(Some(monitor)),
        });
        Ok((engine, notices))
    }

    /// Tear the connection down: stop the monitor, close every watch, and
    /// drop the cache. The engine is inert afterwards; context switching
    /// connects a fresh one.
    pub async fn shutdown(&self) {
        let monitor = self.lock_monitor().take();
        if let Some(m) = monitor {
            m.stop().await;
        }
        let closed = self.hub.close_all();
        self.repo.clear();
        info!(watches_closed = closed, "engine shut down");
    }

    pub fn kinds(&self) -> &[ResourceKind] {
        &self.kinds
    }

    pub fn context(&self) -> &ClusterContext {
        self.client.context()
    }

    /// Focus the notice stream on one slice; `None` reports every change.
    pub fn set_focus(&self, key: Option<CacheKey>) {
        self.notifier.set_focus(key);
    }

    /// Online flag of the watch backing a slice, if one is open.
    pub fn online(&self, kind: &str, namespace: &str) -> Option<bool> {
        let kind = kexp_core::find_kind(&self.kinds, kind)?;
        let ns = slice_scope(&kind, namespace);
        self.hub.online(&CacheKey::new(&kind.name, ns))
    }

    fn resolve(&self, kind: &str) -> BackendResult<ResourceKind> {
        kexp_core::find_kind(&self.kinds, kind)
            .ok_or_else(|| BackendError::NotFound(format!("unknown resource kind '{kind}'")))
    }

    /// Kinds without a watch endpoint are list-fetched on first access and
    /// cached until a mutation invalidates the slice.
    async fn fetch_unwatched(&self, kind: &ResourceKind, namespace: &str) -> BackendResult<()> {
        let ns = slice_scope(kind, namespace);
        let key = CacheKey::new(&kind.name, ns);
        if self.repo.contains(&key) {
            return Ok(());
        }
        let url = paths::list(self.client.server(), &kind.api_prefix, &kind.name, ns)?;
        let body = self.client.execute(Method::GET, url, None).await?;
        let items = parse_list_items(&body)?;
        info!(%key, count = items.len(), "list fetch for unwatched kind");
        self.repo.replace(&key, items);
        Ok(())
    }

    fn lock_monitor(&self) -> std::sync::MutexGuard<'_, Option<MonitorHandle>> {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl ClusterBackend for Engine {
    async fn items(&self, kind: &str, namespace: &str) -> BackendResult<Vec<Value>> {
        let kind = self.resolve(kind)?;
        if !kind.watchable {
            self.fetch_unwatched(&kind, namespace).await?;
        }
        Ok(self.repo.items(&kind, namespace))
    }

    async fn get(&self, kind: &str, namespace: &str, name: &str) -> BackendResult<Option<Value>> {
        let kind = self.resolve(kind)?;
        if let Some(obj) = self.repo.get(&kind, namespace, name) {
            return Ok(Some(obj));
        }
        // Cache miss: read the detail endpoint directly. Without a concrete
        // namespace there is no detail URL to try, so the miss is the answer.
        if kind.namespaced && (namespace.is_empty() || namespace == ALL_NAMESPACES) {
            return Ok(None);
        }
        let ns = detail_scope(&kind, namespace)?;
        let url = paths::detail(self.client.server(), &kind.api_prefix, &kind.name, ns, name)?;
        let body = self.client.execute(Method::GET, url, None).await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let obj: Value = serde_json::from_str(&body)
            .map_err(|e| BackendError::Internal(format!("unparseable detail body: {e}")))?;
        // A 404 comes back as a Status object rather than the resource.
        if path::str_at(&obj, &["kind"]) == Some("Status") {
            return Ok(None);
        }
        Ok(Some(obj))
    }

    async fn delete(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        immediate: bool,
    ) -> BackendResult<()> {
        let kind = self.resolve(kind)?;
        let ns = detail_scope(&kind, namespace)?;
        let mut url = paths::detail(self.client.server(), &kind.api_prefix, &kind.name, ns, name)?;
        if immediate {
            url.query_pairs_mut().append_pair("gracePeriodSeconds", "0");
        }
        self.client.execute(Method::DELETE, url, None).await?;
        info!(kind = %kind.name, namespace = ns.unwrap_or(""), %name, immediate, "deleted");
        if !kind.watchable {
            // No watch will reflect the change; force a refetch.
            self.repo.drop_slice(&CacheKey::new(&kind.name, ns));
            self.repo.drop_slice(&CacheKey::new(&kind.name, None));
        }
        Ok(())
    }

    async fn scale(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        delta: i64,
    ) -> BackendResult<i64> {
        let kind = self.resolve(kind)?;
        let ns = detail_scope(&kind, namespace)?;
        let url = paths::detail(self.client.server(), &kind.api_prefix, &kind.name, ns, name)?;
        let body = self.client.execute(Method::GET, url.clone(), None).await?;
        let obj: Value = serde_json::from_str(&body)
            .map_err(|e| BackendError::Internal(format!("unparseable detail body: {e}")))?;
        let current = path::i64_at(&obj, &["spec", "replicas"]).ok_or_else(|| {
            BackendError::Validation(format!("{}/{name} has no spec.replicas", kind.name))
        })?;
        let target = (current + delta).max(0);
        let patch = json!({"spec": {"replicas": target}}).to_string();
        self.client.execute(Method::PATCH, url, Some(patch)).await?;
        info!(kind = %kind.name, %name, from = current, to = target, "scaled");
        Ok(target)
    }

    async fn read_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> BackendResult<String> {
        let url = paths::pod_logs(
            self.client.server(),
            namespace,
            pod,
            container,
            LOG_TAIL_LINES,
            false,
        )?;
        let body = self.client.execute(Method::GET, url, None).await?;
        Ok(stream::clean_log_text(&body))
    }

    async fn follow_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> BackendResult<StreamHandle<LogChunk>> {
        let url = paths::pod_logs(
            self.client.server(),
            namespace,
            pod,
            container,
            LOG_TAIL_LINES,
            true,
        )?;
        let resp = self.client.open_stream(url).await?;
        let (tx, rx) = mpsc::channel(LOG_QUEUE_CAPACITY);
        let (cancel, cancel_rx) = CancelHandle::pair();
        let label = format!("{namespace}/{pod}/{container}");
        info!(stream = %label, "log follow started");
        tokio::spawn(async move {
            stream::pump_lines(resp.bytes_stream(), tx, cancel_rx, &label).await;
        });
        Ok(StreamHandle { rx, cancel })
    }

    async fn exec_command(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> BackendResult<String> {
        if command.is_empty() {
            return Err(BackendError::Validation("empty exec command".into()));
        }
        let args = kubectl_exec_args(&self.client.context().name, namespace, pod, container, command);
        info!(%pod, %container, cmd = %command.join(" "), "exec via kubectl");
        let output = tokio::process::Command::new("kubectl")
            .args(&args)
            .output()
            .await
            .map_err(|e| BackendError::Internal(format!("failed to run kubectl: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(%pod, status = ?output.status.code(), "exec failed");
            return Err(BackendError::Internal(format!(
                "kubectl exec exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn availability(&self) -> BackendResult<()> {
        self.client.probe().await.map_err(Into::into)
    }

    fn set_sort_field(&self, field: SortField) {
        self.repo.set_sort_field(field);
    }

    fn toggle_sort_direction(&self) {
        self.repo.toggle_sort_direction();
    }
}

/// Namespace a slice is keyed under: concrete namespaces only; the
/// all-namespaces sentinel and cluster-scoped kinds map to the unscoped
/// slice.
fn slice_scope<'a>(kind: &ResourceKind, namespace: &'a str) -> Option<&'a str> {
    if kind.namespaced && !namespace.is_empty() && namespace != ALL_NAMESPACES {
        Some(namespace)
    } else {
        None
    }
}

/// Detail endpoints of namespaced kinds need a concrete namespace.
fn detail_scope<'a>(kind: &ResourceKind, namespace: &'a str) -> BackendResult<Option<&'a str>> {
    if !kind.namespaced {
        return Ok(None);
    }
    if namespace.is_empty() || namespace == ALL_NAMESPACES {
        return Err(BackendError::Validation(format!(
            "a concrete namespace is required for {}",
            kind.name
        )));
    }
    Ok(Some(namespace))
}

fn parse_list_items(body: &str) -> BackendResult<Vec<Value>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| BackendError::Internal(format!("unparseable list body: {e}")))?;
    match parsed.get("items") {
        Some(Value::Array(items)) => Ok(items.clone()),
        _ => Ok(Vec::new()),
    }
}

fn kubectl_exec_args(
    context: &str,
    namespace: &str,
    pod: &str,
    container: &str,
    command: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--context".into(),
        context.into(),
        "exec".into(),
        "-n".into(),
        namespace.into(),
        pod.into(),
        "-c".into(),
        container.into(),
        "--".into(),
    ];
    args.extend(command.iter().cloned());
    args
}

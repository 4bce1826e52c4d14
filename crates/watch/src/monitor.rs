//! Liveness monitor: a periodic probe that degrades every watch to an
//! offline display state when the API server stops answering.
//!
//! The monitor never closes or restarts streams; a handle recovers on its
//! next delivered event. It stops via an explicit done-signal, independent
//! of any stream's lifecycle.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kexp_client::RestClient;
use kexp_store::Notifier;

use crate::WatchHub;

pub struct MonitorHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal the monitor to stop and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.task.await;
    }
}

/// Start the periodic liveness probe against the given client.
pub fn spawn_monitor(
    client: Arc<RestClient>,
    hub: Arc<WatchHub>,
    notifier: Arc<Notifier>,
    interval: Duration,
) -> MonitorHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a freshly started
        // engine is not probed before its watches settle.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    debug!("liveness monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match client.probe().await {
                        Ok(()) => debug!("liveness probe ok"),
                        Err(e) => {
                            counter!("kexp_probe_failures_total", 1);
                            warn!(error = %e, "liveness probe failed; marking watches offline");
                            hub.set_all_offline();
                            notifier.offline();
                        }
                    }
                }
            }
        }
    });
    info!(interval_secs = interval.as_secs(), "liveness monitor started");
    MonitorHandle { stop: Some(stop_tx), task }
}

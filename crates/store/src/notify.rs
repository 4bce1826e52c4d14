//! Change notification toward the presentation layer.
//!
//! Workers never block on delivery: the channel is bounded and `try_send`
//! drops on overflow, so a stalled UI can only cost it repaints, not
//! ingestion. Slice-change notices are additionally filtered to the slice
//! currently on display.

use std::sync::RwLock;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::trace;

use kexp_core::CacheKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The given slice changed; re-render if it is on display.
    Changed(CacheKey),
    /// Asynchronous user-visible warning (e.g. a watch stream failed).
    Warning(String),
    /// The API server stopped answering the liveness probe.
    Offline,
}

pub struct Notifier {
    tx: mpsc::Sender<Notice>,
    focus: RwLock<Option<CacheKey>>,
}

impl Notifier {
    /// Create a notifier with a bounded queue the presentation layer
    /// drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notice>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, focus: RwLock::new(None) }, rx)
    }

    /// Record which slice the presentation layer currently shows. `None`
    /// forwards every change notice.
    pub fn set_focus(&self, key: Option<CacheKey>) {
        *self.focus.write().unwrap_or_else(|e| e.into_inner()) = key;
    }

    /// Announce a slice change. Filtered by focus; dropped when the queue
    /// is full.
    pub fn changed(&self, key: &CacheKey) {
        let focus = self.focus.read().unwrap_or_else(|e| e.into_inner());
        if let Some(ref f) = *focus {
            if f != key {
                trace!(%key, "change notice suppressed (not on display)");
                return;
            }
        }
        self.push(Notice::Changed(key.clone()));
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.push(Notice::Warning(message.into()));
    }

    pub fn offline(&self) {
        self.push(Notice::Offline);
    }

    fn push(&self, notice: Notice) {
        if self.tx.try_send(notice).is_err() {
            counter!("kexp_notices_dropped_total", 1);
        }
    }
}

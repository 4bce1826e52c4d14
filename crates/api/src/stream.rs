//! Line-oriented streaming plumbing for log follow.
//!
//! A follow stream is a spawned pump task feeding a bounded channel; the
//! caller reads chunks from the receiver and cancels via the handle, which
//! drops the in-flight response and closes the connection.

use bytes::BytesMut;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// One line of log output, control bytes already stripped.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub line: String,
}

/// Cancellation handle for an in-flight stream.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub(crate) fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running stream: chunks arrive on `rx` until the remote side closes or
/// `cancel` fires.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// Remove terminal escape introducers and carriage returns. Container
/// runtimes pass colored output through; the raw ESC bytes garble plain
/// text sinks.
pub fn clean_log_text(raw: &str) -> String {
    raw.chars().filter(|&c| c != '\u{1b}' && c != '\r').collect()
}

/// Consume a byte stream, split on newlines, and forward cleaned lines into
/// the bounded channel. Lines are dropped when the channel is full; the
/// trailing partial line is flushed at end of stream.
pub(crate) async fn pump_lines<S, E>(
    stream: S,
    tx: mpsc::Sender<LogChunk>,
    mut cancel_rx: oneshot::Receiver<()>,
    label: &str,
) where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = BytesMut::new();
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                debug!(stream = %label, "log pump cancelled");
                return;
            }
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    buf.extend_from_slice(&chunk);
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line = buf.split_to(pos);
                        let _ = buf.split_to(1); // the '\n'
                        forward(&tx, &line);
                    }
                }
                Some(Err(e)) => {
                    warn!(stream = %label, error = %e, "log stream read failed");
                    break;
                }
                None => break,
            }
        }
    }
    if !buf.is_empty() {
        forward(&tx, &buf);
    }
    debug!(stream = %label, "log pump ended");
}

fn forward(tx: &mpsc::Sender<LogChunk>, line: &[u8]) {
    if let Ok(s) = std::str::from_utf8(line) {
        let _ = tx.try_send(LogChunk { line: clean_log_text(s) });
    } else {
        warn!("non-UTF-8 log line skipped");
    }
}

//! Debounced background saving.

use crate::error::{Result, ServiceError};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub type SaveFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

enum Command {
    Mark,
    Flush(oneshot::Sender<Result<()>>),
}

/// Coalesces bursts of change marks into one save after a quiet interval.
///
/// Dropping the saver lets the worker perform a final save of pending changes.
#[derive(Debug, Clone)]
pub struct AutoSaver {
    tx: mpsc::UnboundedSender<Command>,
}

impl AutoSaver {
    /// Must be called inside a tokio runtime.
    pub fn spawn(quiet: Duration, save: SaveFn) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, quiet, save));
        Self { tx }
    }

    /// Record that something changed; the save happens once things go quiet.
    pub fn mark(&self) {
        let _ = self.tx.send(Command::Mark);
    }

    /// Save right now, regardless of the debounce window.
    pub async fn flush(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .map_err(|_| ServiceError::PersistenceError("autosave worker stopped".into()))?;
        done.await
            .map_err(|_| ServiceError::PersistenceError("autosave worker stopped".into()))?
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, quiet: Duration, save: SaveFn) {
    let mut pending = false;
    loop {
        let next = if pending {
            match tokio::time::timeout(quiet, rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    pending = false;
                    if let Err(e) = save().await {
                        tracing::warn!(error = %e, "autosave failed");
                    }
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match next {
            Some(Command::Mark) => pending = true,
            Some(Command::Flush(reply)) => {
                pending = false;
                let _ = reply.send(save().await);
            }
            None => {
                if pending {
                    if let Err(e) = save().await {
                        tracing::warn!(error = %e, "final autosave failed");
                    }
                }
                break;
            }
        }
    }
}

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type ActionFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

struct QueuedAction {
    name: String,
    run: ActionFuture,
    done: oneshot::Sender<Result<(), String>>,
}

/// Completion handle for a queued action. Dropping it does not cancel the
/// action.
pub struct ActionTicket {
    done: oneshot::Receiver<Result<(), String>>,
}

impl ActionTicket {
    pub async fn wait(self) -> Result<(), String> {
        self.done
            .await
            .unwrap_or_else(|_| Err("action queue stopped".to_string()))
    }
}

/// Runs user-triggered operations strictly one after another, in the order
/// they were enqueued. A failing or panicking action is logged and the next
/// one still runs.
pub struct ActionQueue {
    tx: mpsc::UnboundedSender<QueuedAction>,
    pending: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

impl ActionQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(drain_actions(rx, Arc::clone(&pending)));
        Self {
            tx,
            pending,
            worker,
        }
    }

    pub fn enqueue<F, E>(&self, name: impl Into<String>, action: F) -> ActionTicket
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let queued = QueuedAction {
            name: name.into(),
            run: Box::pin(action.map(|result| result.map_err(|err| err.to_string()))),
            done: done_tx,
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(rejected)) = self.tx.send(queued) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            log::warn!("action queue is not running; dropping {}", rejected.name);
            let _ = rejected.done.send(Err("action queue stopped".to_string()));
        }

        ActionTicket { done: done_rx }
    }

    /// Actions enqueued but not yet finished, including the running one.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActionQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn drain_actions(mut rx: mpsc::UnboundedReceiver<QueuedAction>, pending: Arc<AtomicUsize>) {
    while let Some(action) = rx.recv().await {
        let QueuedAction { name, run, done } = action;
        log::debug!("running action {name}");

        let outcome = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                log::warn!("action {name} failed: {err}");
                Err(err)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                log::error!("action {name} panicked: {message}");
                Err(format!("action panicked: {message}"))
            }
        };

        pending.fetch_sub(1, Ordering::SeqCst);
        let _ = done.send(outcome);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = panic.downcast_ref::<String>() {
        return text.clone();
    }
    "unknown panic".to_string()
}

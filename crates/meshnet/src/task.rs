//! Task lifecycle: the node-wide shutdown signal and the task group that
//! `Node::backend_wait` drains.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinSet;

/// Receiving side of the node-wide cancellation signal.
///
/// Backed by a watch channel so a receiver created after `Node::shutdown`
/// still observes it.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Shutdown is raised once `rx` holds `true`.
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Resolves once shutdown has been raised (or the node is gone).
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|raised| *raised).await;
    }

    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Every long-running task a node owns. Tasks may spawn further tasks into
/// the same group while it is being drained.
#[derive(Clone, Default)]
pub(crate) struct TaskGroup {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl TaskGroup {
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished tasks.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Wait until the group is empty, including tasks spawned while waiting.
    pub(crate) async fn wait(&self) {
        loop {
            let mut batch = {
                let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *tasks)
            };
            if batch.is_empty() {
                return;
            }
            while let Some(result) = batch.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        tracing::error!(error = %e, "node task panicked");
                    }
                }
            }
        }
    }

    /// Tasks not yet reaped. Finished tasks linger until the next spawn.
    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

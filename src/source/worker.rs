//! Supervised background loops.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Owns a group of loops that share one stop signal.
///
/// [`shutdown`](Self::shutdown) raises the signal, then joins each loop with a
/// bounded timeout and aborts any loop that does not finish in time.
pub(crate) struct Worker {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    join_timeout: Duration,
}

impl Worker {
    pub fn new(name: &'static str, join_timeout: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name,
            stop_tx,
            handles: Mutex::new(Vec::new()),
            join_timeout,
        }
    }

    /// Returns a receiver for the stop signal, clearing any previous stop.
    pub fn arm(&self) -> StopSignal {
        self.stop_tx.send_replace(false);
        StopSignal(self.stop_tx.subscribe())
    }

    /// Spawns a loop owned by this worker.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(tokio::spawn(task));
    }

    /// Returns `true` while any owned loop is still running.
    pub fn is_running(&self) -> bool {
        self.handles.lock().iter().any(|h| !h.is_finished())
    }

    /// Signals every loop to stop and waits for them.
    pub async fn shutdown(&self) {
        self.stop_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.handles.lock());
        for mut handle in handles {
            if tokio::time::timeout(self.join_timeout, &mut handle).await.is_err() {
                warn!(worker = self.name, "loop did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

/// The receiving side of a [`Worker`]'s stop signal.
#[derive(Clone)]
pub(crate) struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Sleeps for `duration` or until stopped.
    ///
    /// Returns `true` if the loop should exit.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        let interrupted = tokio::select! {
            () = tokio::time::sleep(duration) => false,
            () = self.stopped() => true,
        };
        interrupted || self.is_stopped()
    }

    /// Resolves once the stop signal is raised or its worker is gone.
    pub async fn stopped(&mut self) {
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }
}

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::client::ObservableClient;

/// Background task that collects idle cache entries of one client.
///
/// The task holds the client weakly and ends on its own once the client is
/// dropped.
pub struct GcWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl GcWorker {
    pub(crate) fn spawn(client: Weak<ObservableClient>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = sleep(interval) => {
                        let Some(client) = client.upgrade() else {
                            break;
                        };
                        let collected = client.gc();
                        if !collected.is_empty() {
                            debug!(collected = collected.len(), "periodic cache gc");
                        }
                    }
                }
            }
        });
        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    /// Signal the worker to stop and wait for it to finish.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

impl std::fmt::Debug for GcWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcWorker")
            .field("running", &self.join_handle.is_some())
            .finish()
    }
}

//! Spool dispatcher: a bounded queue drained by router workers.

use crate::pipeline::StateRouter;
use postroute_common::{Error, Mail, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Accepts mail into a bounded queue and drives each item through the
/// router on a fixed pool of workers.
///
/// Backpressure is the queue bound: `enqueue` waits for capacity rather
/// than dropping. Shutdown closes the queue and lets the workers drain
/// what was already accepted.
pub struct SpoolDispatcher {
    tx: mpsc::Sender<Mail>,
    workers: Vec<JoinHandle<()>>,
}

impl SpoolDispatcher {
    pub fn start(router: Arc<StateRouter>, workers: usize, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Mail>(queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|id| {
                let router = router.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    Self::worker_loop(id, router, rx).await;
                })
            })
            .collect();

        Self { tx, workers }
    }

    async fn worker_loop(id: usize, router: Arc<StateRouter>, rx: Arc<Mutex<mpsc::Receiver<Mail>>>) {
        info!(worker = id, "spool worker started");
        loop {
            let mail = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(mut mail) = mail else {
                info!(worker = id, "spool worker stopping");
                return;
            };

            match router.route(&mut mail).await {
                Ok(()) => {
                    info!(
                        worker = id,
                        mail = mail.name(),
                        state = mail.state(),
                        "mail processed"
                    );
                }
                Err(e) => {
                    error!(
                        worker = id,
                        mail = mail.name(),
                        "routing failed: {e}"
                    );
                }
            }
        }
    }

    /// Queue a mail for processing. Fails only once the dispatcher has
    /// been shut down.
    pub async fn enqueue(&self, mail: Mail) -> Result<()> {
        self.tx
            .send(mail)
            .await
            .map_err(|_| Error::Spool("spool queue is closed".to_string()))
    }

    /// Close the queue and wait for the workers to drain it.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("spool worker did not stop cleanly: {e}");
            }
        }
    }
}

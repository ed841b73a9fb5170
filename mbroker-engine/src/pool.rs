//! Worker pool executing chains for different resources in parallel.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chain::TaskChain;
use crate::error::ChainError;
use crate::runner::{ChainOutcome, ChainRunner};

struct Job {
    chain: TaskChain,
    reply: oneshot::Sender<ChainOutcome>,
}

/// Resolves to the outcome of a dispatched chain.
pub struct ChainHandle {
    resource_id: String,
    operation: crate::chain::Operation,
    rx: oneshot::Receiver<ChainOutcome>,
}

impl ChainHandle {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub async fn wait(self) -> ChainOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => ChainOutcome {
                resource_id: self.resource_id,
                operation: self.operation,
                result: Err(ChainError::WorkerGone),
            },
        }
    }
}

/// N workers draining one shared queue. Each chain runs on a single
/// worker from start to finish.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(runner: Arc<ChainRunner>, worker_count: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(256);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let runner = runner.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else {
                            debug!(worker, "Queue closed, worker exiting");
                            break;
                        };
                        let outcome = runner.run(job.chain).await;
                        // caller may have stopped waiting
                        let _ = job.reply.send(outcome);
                    }
                })
            })
            .collect();

        info!(workers = worker_count.max(1), "Worker pool started");
        Self { tx, workers }
    }

    /// Queue a chain. The handle resolves once the chain and its
    /// continuation have run.
    pub async fn dispatch(&self, chain: TaskChain) -> ChainHandle {
        let (reply, rx) = oneshot::channel();
        let handle = ChainHandle {
            resource_id: chain.resource_id.clone(),
            operation: chain.operation,
            rx,
        };
        // a closed queue surfaces as WorkerGone on wait()
        let _ = self.tx.send(Job { chain, reply }).await;
        handle
    }

    /// Stop accepting work and wait for queued chains to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        join_all(self.workers).await;
    }
}

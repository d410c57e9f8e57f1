//! Binds the relay loop to the lifetime of the server process.
//!
//! The loop runs on a dedicated OS thread with its own single-threaded tokio
//! runtime, so slow broker or ingestion I/O never competes with request
//! handling. A host is started once and consumed by [`WorkerHost::shutdown`].

use std::thread;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::relay::{Relay, RelayError};

const WORKER_THREAD_NAME: &str = "relay-worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The loop observed cancellation and closed its broker connection.
    Drained,
    /// The loop was still busy when the grace period ran out.
    TimedOut,
}

pub struct WorkerHost {
    cancel: CancellationToken,
    thread: thread::JoinHandle<()>,
    finished: oneshot::Receiver<()>,
}

impl WorkerHost {
    /// Spawn the worker and wait until the relay is consuming.
    ///
    /// Fails if the broker is unreachable or the queue declaration is rejected.
    pub async fn start(relay: Relay) -> Result<Self, RelayError> {
        let queue = relay.queue().name.clone();
        let policy = relay.policy();
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), RelayError>>();
        let (finished_tx, finished) = oneshot::channel();
        let token = cancel.clone();

        let thread = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(RelayError::Spawn(e)));
                        return;
                    }
                };
                runtime.block_on(async move {
                    match relay.open().await {
                        Ok(session) => {
                            let _ = ready_tx.send(Ok(()));
                            relay.consume(session, token).await;
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e.into()));
                        }
                    }
                });
                let _ = finished_tx.send(());
            })?;

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(thread = WORKER_THREAD_NAME, queue = %queue, policy = %policy, "Relay worker started");
                Ok(Self { cancel, thread, finished })
            }
            Ok(Err(e)) => {
                let _ = tokio::task::spawn_blocking(move || thread.join()).await;
                Err(e)
            }
            Err(_) => Err(RelayError::WorkerLost),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Signal the loop to stop and wait up to `grace` for it to drain.
    pub async fn shutdown(self, grace: Duration) -> ShutdownOutcome {
        let Self { cancel, thread, finished } = self;
        cancel.cancel();

        match tokio::time::timeout(grace, finished).await {
            Ok(Ok(())) => {
                if tokio::task::spawn_blocking(move || thread.join()).await.is_err() {
                    error!("Relay worker could not be joined");
                }
                info!("Relay worker drained");
                ShutdownOutcome::Drained
            }
            Ok(Err(_)) => {
                // Sender dropped without signalling: the worker panicked.
                let _ = tokio::task::spawn_blocking(move || thread.join()).await;
                error!("Relay worker terminated abnormally");
                ShutdownOutcome::Drained
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Relay worker did not drain in time");
                ShutdownOutcome::TimedOut
            }
        }
    }
}

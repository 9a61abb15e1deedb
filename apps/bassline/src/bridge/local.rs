//! In-process bridge: the kernel runs on its own tokio task.
//!
//! Requests travel over an mpsc channel, each with a oneshot reply channel
//! and a request id the response must echo. Content changes are fanned out
//! on a broadcast channel. While the active scheduler wants ticks, the task
//! ticks the kernel every window.

use super::{Bridge, BridgeError, check_correlation};
use bassline_core::{
    BridgeKind, CommandRequest, CommandResponse, ContactChange, ExternalInput, Kernel,
};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Requests queued before senders wait.
const REQUEST_QUEUE_DEPTH: usize = 256;

/// Changes buffered per broadcast receiver before it lags.
const CHANGE_BUFFER: usize = 1024;

struct Envelope {
    request: CommandRequest,
    reply: oneshot::Sender<CommandResponse>,
}

pub struct LocalBridge {
    requests: mpsc::Sender<Envelope>,
    changes: broadcast::Sender<ContactChange>,
    next_request: AtomicU64,
    task: JoinHandle<Kernel>,
}

impl std::fmt::Debug for LocalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBridge")
            .field("next_request", &self.next_request)
            .field("receivers", &self.changes.receiver_count())
            .finish_non_exhaustive()
    }
}

impl LocalBridge {
    /// Attach to an initialized kernel and move it onto a new task.
    pub fn spawn(mut kernel: Kernel) -> Result<Self, BridgeError> {
        kernel
            .attach_bridge(BridgeKind::Local)
            .map_err(|e| BridgeError::Transport(e.to_string()))?;

        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let sender = changes.clone();
        kernel.subscribe(Box::new(move |change: &ContactChange| {
            // No receivers is fine.
            let _ = sender.send(change.clone());
        }));

        let (requests, inbox) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let task = tokio::spawn(run(kernel, inbox));
        tracing::info!("local bridge started");

        Ok(Self {
            requests,
            changes,
            next_request: AtomicU64::new(1),
            task,
        })
    }

    /// A receiver for every content change applied from now on.
    pub fn changes(&self) -> broadcast::Receiver<ContactChange> {
        self.changes.subscribe()
    }

    /// Execute a raw request envelope. The caller owns correlation.
    pub async fn execute(&self, request: CommandRequest) -> Result<CommandResponse, BridgeError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Envelope { request, reply })
            .await
            .map_err(|_| BridgeError::Closed)?;
        response.await.map_err(|_| BridgeError::Closed)
    }

    /// Stop the task and hand the kernel back, detached.
    pub async fn shutdown(self) -> Result<Kernel, BridgeError> {
        drop(self.requests);
        let mut kernel = self
            .task
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        kernel.detach_bridge();
        tracing::info!("local bridge stopped");
        Ok(kernel)
    }

    fn next_request_id(&self) -> String {
        format!("local-{}", self.next_request.fetch_add(1, Ordering::Relaxed))
    }
}

impl Bridge for LocalBridge {
    const KIND: BridgeKind = BridgeKind::Local;

    fn send(&self, input: ExternalInput) -> impl Future<Output = Result<Value, BridgeError>> + Send {
        async move {
            let request_id = self.next_request_id();
            let request = CommandRequest::new(input).with_request_id(request_id.clone());
            let response = self.execute(request).await?;
            check_correlation(&request_id, response.request_id.as_deref())?;
            response.into_result().map_err(BridgeError::from)
        }
    }
}

// =============================================================================
// KERNEL TASK
// =============================================================================

/// Serve requests until every sender is dropped; ticks in between.
async fn run(mut kernel: Kernel, mut inbox: mpsc::Receiver<Envelope>) -> Kernel {
    let mut next_tick: Option<Instant> = None;
    loop {
        if next_tick.is_none() {
            next_tick = kernel.tick_interval().map(|window| Instant::now() + window);
        }
        let deadline = next_tick.unwrap_or_else(Instant::now);

        tokio::select! {
            envelope = inbox.recv() => {
                let Some(Envelope { request, reply }) = envelope else {
                    break;
                };
                let response = kernel.execute(request);
                if reply.send(response).is_err() {
                    tracing::debug!("requester dropped before the reply");
                }
                // A scheduler switch changes the window.
                if kernel.tick_interval().is_none() {
                    next_tick = None;
                }
            }
            () = tokio::time::sleep_until(deadline), if next_tick.is_some() => {
                next_tick = None;
                match kernel.tick() {
                    Ok(0) => {}
                    Ok(applied) => tracing::debug!(applied, "tick"),
                    Err(e) => tracing::warn!(error = %e, "tick failed"),
                }
            }
        }
    }
    kernel
}

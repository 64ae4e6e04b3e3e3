//! Client-to-worker affinity and the per-client session worker.
//!
//! Each client identity is bound to exactly one worker task for the life of
//! the process. The worker is the only place a request may wait on a lock, so
//! a client stuck in `LOCK` never holds up the broker or any other client.

use std::{collections::HashMap, fmt, sync::Arc};

use anyhow::{Context, Result};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    error::ProtocolError,
    lock::LockManager,
    protocol::{ClientId, Reply, Request},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Request routed by the broker to a client's worker.
///
/// A line that could not be decoded still reaches the worker, so its error
/// reply is ordered with the client's other replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub client: ClientId,
    pub payload: Result<String, ProtocolError>,
}

/// Reply produced by a worker for the broker to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub worker: WorkerId,
    pub client: ClientId,
    pub payload: String,
}

/// Address of a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    inbox: mpsc::UnboundedSender<RequestEnvelope>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn forward(&self, envelope: RequestEnvelope) -> Result<()> {
        self.inbox
            .send(envelope)
            .map_err(|_| anyhow::anyhow!("{} is no longer running", self.id))
    }
}

/// Append-only map from client identity to its dedicated worker.
pub struct SessionRegistry {
    sessions: Mutex<Sessions>,
    manager: Arc<LockManager>,
    replies: mpsc::UnboundedSender<ReplyEnvelope>,
}

#[derive(Default)]
struct Sessions {
    workers: HashMap<ClientId, WorkerHandle>,
    last_worker: u64,
}

impl SessionRegistry {
    /// Workers created by this registry send their replies into `replies`.
    pub fn new(manager: Arc<LockManager>, replies: mpsc::UnboundedSender<ReplyEnvelope>) -> Self {
        Self {
            sessions: Mutex::new(Sessions::default()),
            manager,
            replies,
        }
    }

    /// Returns the worker bound to `client`, starting one on first contact.
    ///
    /// For a new client this waits for the worker's ready signal before
    /// returning, but never for any lock.
    pub async fn resolve_worker(&self, client: ClientId) -> Result<WorkerHandle> {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.workers.get(&client) {
            return Ok(handle.clone());
        }

        sessions.last_worker += 1;
        let id = WorkerId(sessions.last_worker);
        let handle = self.spawn_worker(id, client).await?;
        sessions.workers.insert(client, handle.clone());
        info!(client, worker = %id, "session worker started");

        Ok(handle)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.workers.len()
    }

    async fn spawn_worker(&self, id: WorkerId, client: ClientId) -> Result<WorkerHandle> {
        let (inbox, requests) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = SessionWorker {
            id,
            client,
            manager: Arc::clone(&self.manager),
            requests,
            replies: self.replies.clone(),
        };
        tokio::spawn(worker.run(ready_tx));

        ready_rx
            .await
            .with_context(|| format!("{id} exited before signalling ready"))?;

        Ok(WorkerHandle { id, inbox })
    }
}

struct SessionWorker {
    id: WorkerId,
    client: ClientId,
    manager: Arc<LockManager>,
    requests: mpsc::UnboundedReceiver<RequestEnvelope>,
    replies: mpsc::UnboundedSender<ReplyEnvelope>,
}

impl SessionWorker {
    async fn run(mut self, ready: oneshot::Sender<()>) {
        if ready.send(()).is_err() {
            return;
        }

        while let Some(envelope) = self.requests.recv().await {
            if envelope.client != self.client {
                warn!(worker = %self.id, client = envelope.client, "request for another client dropped");
                continue;
            }

            let reply = self.handle(envelope.payload).await;
            let reply = ReplyEnvelope {
                worker: self.id,
                client: self.client,
                payload: reply.to_string(),
            };
            if self.replies.send(reply).is_err() {
                debug!(worker = %self.id, "broker gone, stopping worker");
                break;
            }
        }
    }

    async fn handle(&self, payload: Result<String, ProtocolError>) -> Reply {
        let request = match payload.and_then(|line| Request::parse(&line)) {
            Ok(request) => request,
            Err(err) => {
                debug!(client = self.client, error = %err, "rejected request");
                return Reply::error(err.reason());
            }
        };

        let client = self.client;
        match request {
            Request::Lock { resource, mode } => {
                self.manager.acquire(&resource, mode, client).await;
                Reply::Ok
            }
            Request::Unlock { resource, mode } => {
                if self.manager.release(&resource, client).is_none() {
                    debug!(client, %resource, %mode, "unlock without matching hold");
                }
                Reply::Ok
            }
            Request::Read { resource } => match self.manager.read(&resource).await {
                Ok(value) => Reply::Value(value),
                Err(err) => {
                    warn!(client, %resource, error = %err, "read failed");
                    Reply::error(err.reason())
                }
            },
            Request::Write { resource, payload } => {
                match self.manager.write(&resource, client, &payload).await {
                    Ok(()) => Reply::Ok,
                    Err(err) => {
                        debug!(client, %resource, error = %err, "write refused");
                        Reply::error(err.reason())
                    }
                }
            }
        }
    }
}

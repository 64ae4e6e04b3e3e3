use std::{collections::HashMap, future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{
        TcpListener, TcpSocket, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    task::AbortHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{FrameError, ProtocolError},
    lock::LockManager,
    protocol::{ClientId, read_frame, write_frame},
    session::{ReplyEnvelope, RequestEnvelope, SessionRegistry},
};

/// Binds a listening socket with an explicit accept backlog.
pub fn bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Routes request lines from TCP clients to their session workers and the
/// workers' replies back, without ever waiting on a lock itself.
pub struct Broker {
    listener: TcpListener,
    manager: Arc<LockManager>,
}

impl Broker {
    pub fn new(listener: TcpListener, manager: Arc<LockManager>) -> Self {
        Self { listener, manager }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker { listener, manager } = self;
        tokio::pin!(shutdown);

        let (frontend_tx, mut frontend_rx) = mpsc::unbounded_channel();
        let (backend_tx, mut backend_rx) = mpsc::unbounded_channel();
        let mut router = Router::new(SessionRegistry::new(manager, backend_tx), frontend_tx);

        loop {
            select! {
                _ = &mut shutdown => {
                    router.shutdown();
                    break;
                }
                accept_result = listener.accept() => {
                    router.handle_accept_result(accept_result);
                }
                Some(event) = frontend_rx.recv() => {
                    router.handle_frontend(event).await;
                }
                Some(reply) = backend_rx.recv() => {
                    router.handle_backend(reply);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Traffic arriving from the client-facing side.
#[derive(Debug)]
enum FrontendEvent {
    Request {
        client: ClientId,
        payload: Result<String, ProtocolError>,
    },
    Disconnected { client: ClientId },
}

struct Connection {
    peer: SocketAddr,
    outbox: mpsc::UnboundedSender<String>,
    reader: AbortHandle,
}

struct Router {
    registry: SessionRegistry,
    connections: HashMap<ClientId, Connection>,
    frontend: mpsc::UnboundedSender<FrontendEvent>,
    last_client: ClientId,
}

impl Router {
    fn new(registry: SessionRegistry, frontend: mpsc::UnboundedSender<FrontendEvent>) -> Self {
        Self {
            registry,
            connections: HashMap::new(),
            frontend,
            last_client: 0,
        }
    }

    fn handle_accept_result(&mut self, result: io::Result<(TcpStream, SocketAddr)>) {
        match result {
            Ok((stream, peer)) => self.register_connection(stream, peer),
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }

    fn register_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.last_client += 1;
        let client = self.last_client;
        let (reader, writer) = stream.into_split();
        let (outbox, pending) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_requests(client, reader, self.frontend.clone()));
        tokio::spawn(write_replies(client, writer, pending));

        info!(client, %peer, "client connected");
        self.connections.insert(
            client,
            Connection {
                peer,
                outbox,
                reader: reader.abort_handle(),
            },
        );
    }

    async fn handle_frontend(&mut self, event: FrontendEvent) {
        match event {
            FrontendEvent::Request { client, payload } => {
                let worker = match self.registry.resolve_worker(client).await {
                    Ok(worker) => worker,
                    Err(err) => {
                        warn!(client, error = ?err, "no worker for client");
                        return;
                    }
                };
                debug!(client, worker = %worker.id(), "forwarding request");
                if let Err(err) = worker.forward(RequestEnvelope { client, payload }) {
                    warn!(client, error = ?err, "failed to forward request");
                }
            }
            FrontendEvent::Disconnected { client } => {
                // The session worker stays bound to this identity; only the
                // socket side goes away.
                if let Some(connection) = self.connections.remove(&client) {
                    info!(client, peer = %connection.peer, "client disconnected");
                }
            }
        }
    }

    fn handle_backend(&mut self, reply: ReplyEnvelope) {
        let ReplyEnvelope {
            worker,
            client,
            payload,
        } = reply;
        match self.connections.get(&client) {
            Some(connection) => {
                if connection.outbox.send(payload).is_err() {
                    debug!(client, %worker, "client writer closed, reply dropped");
                }
            }
            None => debug!(client, %worker, "reply for disconnected client dropped"),
        }
    }

    fn shutdown(&mut self) {
        info!(clients = self.connections.len(), "broker shutting down");
        for (_, connection) in self.connections.drain() {
            connection.reader.abort();
        }
    }
}

async fn read_requests(
    client: ClientId,
    reader: OwnedReadHalf,
    frontend: mpsc::UnboundedSender<FrontendEvent>,
) {
    let mut reader = BufReader::new(reader);
    loop {
        let payload = match read_frame(&mut reader).await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => break,
            Err(FrameError::Protocol(err)) => {
                debug!(client, error = %err, "undecodable request line");
                Err(err)
            }
            Err(FrameError::Io(err)) => {
                debug!(client, error = ?err, "client read failed");
                break;
            }
        };
        if frontend
            .send(FrontendEvent::Request { client, payload })
            .is_err()
        {
            return;
        }
    }
    let _ = frontend.send(FrontendEvent::Disconnected { client });
}

async fn write_replies(
    client: ClientId,
    mut writer: OwnedWriteHalf,
    mut pending: mpsc::UnboundedReceiver<String>,
) {
    while let Some(payload) = pending.recv().await {
        if let Err(err) = write_frame(&mut writer, &payload).await {
            debug!(client, error = ?err, "failed to deliver reply to client");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_uses_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().expect("addr"), 16).expect("bind");
        let addr = listener.local_addr().expect("local addr");
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn replies_for_unknown_clients_are_dropped() {
        let (frontend, _frontend_rx) = mpsc::unbounded_channel();
        let (backend, _backend_rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(Arc::new(LockManager::in_memory()), backend);
        let mut router = Router::new(registry, frontend);

        let worker = router
            .registry
            .resolve_worker(42)
            .await
            .expect("resolve worker");
        router.handle_backend(ReplyEnvelope {
            worker: worker.id(),
            client: 42,
            payload: "OK".into(),
        });
        assert!(router.connections.is_empty());
    }
}

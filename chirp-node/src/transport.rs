//! Direct peer transport: username handshake, per-connection receive loops, send and broadcast.
//!
//! Connection lifecycle: Connecting -> Handshaking -> Established -> Closed.
//! Only established connections live in the table, keyed by remote username.
//! When two sockets link the same pair of peers, both ends keep the one opened
//! by the lexicographically smaller username.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chirp_core::wire::{self, HANDSHAKE_BUF_SIZE, RECV_BUF_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established,
    Closed,
}

/// What the transport reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected {
        username: String,
        addr: SocketAddr,
        inbound: bool,
    },
    /// One socket read from `from`.
    Message { from: String, body: String },
    Disconnected { username: String },
}

/// Connection-level failure. Never fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("cannot connect to yourself")]
    SelfConnect,
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("not connected to {0}")]
    NotConnected(String),
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send to {target}: {source}")]
    Send {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

/// Table entry. `id` tells a replaced connection apart from its successor.
struct Connection {
    id: Uuid,
    addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

/// Open connections for one local username.
#[derive(Clone)]
pub struct ConnectionManager {
    username: Arc<str>,
    table: Arc<Mutex<HashMap<String, Connection>>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    read_timeout: Option<Duration>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionManager {
    pub fn new(
        username: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
        read_timeout: Option<Duration>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            username: Arc::from(username),
            table: Arc::new(Mutex::new(HashMap::new())),
            events,
            read_timeout,
            shutdown,
        }
    }

    /// Open a connection to `target`, announce our username, start its receive loop.
    pub async fn connect(&self, target: &str, ip: &str, port: u16) -> Result<(), PeerError> {
        if target == &*self.username {
            return Err(PeerError::SelfConnect);
        }
        if self.is_connected(target).await {
            return Err(PeerError::AlreadyConnected(target.to_string()));
        }
        debug!(peer = target, state = ?ConnectionState::Connecting, "connection state");
        let connect_err = |source| PeerError::Connect {
            target: target.to_string(),
            source,
        };
        let mut stream = TcpStream::connect((ip, port)).await.map_err(connect_err)?;
        let addr = stream.peer_addr().map_err(connect_err)?;

        debug!(peer = target, state = ?ConnectionState::Handshaking, "connection state");
        stream
            .write_all(wire::encode_handshake(&self.username))
            .await
            .map_err(connect_err)?;
        stream.flush().await.map_err(connect_err)?;

        let (reader, writer) = stream.into_split();
        let Some(id) = self.install(target, addr, writer, false).await else {
            // The peer's own connection to us is the one both ends keep.
            return Ok(());
        };
        let this = self.clone();
        let target = target.to_string();
        tokio::spawn(async move { this.receive_loop(reader, target, id).await });
        Ok(())
    }

    /// Accept connections until the listener fails or shutdown is signalled.
    pub async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted peer connection");
                        let this = self.clone();
                        tokio::spawn(async move { this.handle_inbound(stream, addr).await });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        break;
                    }
                },
                _ = stopped(&mut shutdown) => break,
            }
        }
        debug!(user = %self.username, "accept loop stopped");
    }

    /// First read is the remote username; an empty one drops the connection.
    async fn handle_inbound(self, stream: TcpStream, addr: SocketAddr) {
        debug!(%addr, state = ?ConnectionState::Handshaking, "connection state");
        let (mut reader, writer) = stream.into_split();
        let mut buf = vec![0u8; HANDSHAKE_BUF_SIZE];
        let n = match self.read_chunk(&mut reader, &mut buf).await {
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                debug!(%addr, "handshake read failed: {}", e);
                return;
            }
            None => return,
        };
        let Some(username) = wire::decode_handshake(&buf[..n]) else {
            debug!(%addr, "empty handshake, dropping connection");
            return;
        };
        let Some(id) = self.install(&username, addr, writer, true).await else {
            return;
        };
        self.receive_loop(reader, username, id).await;
    }

    /// Put a handshaken socket in the table. None when an existing connection to the
    /// same peer wins the tie-break; the new socket is then closed.
    async fn install(
        &self,
        username: &str,
        addr: SocketAddr,
        mut writer: OwnedWriteHalf,
        inbound: bool,
    ) -> Option<Uuid> {
        let mut table = self.table.lock().await;
        if table.contains_key(username) && !keeps_new(&self.username, username, inbound) {
            drop(table);
            debug!(peer = username, %addr, inbound, "duplicate connection dropped");
            let _ = writer.shutdown().await;
            return None;
        }
        let id = Uuid::new_v4();
        let replaced = table.insert(
            username.to_string(),
            Connection {
                id,
                addr,
                writer: Arc::new(Mutex::new(writer)),
            },
        );
        drop(table);
        debug!(peer = username, state = ?ConnectionState::Established, "connection state");
        match replaced {
            Some(old) => {
                debug!(peer = username, old = %old.addr, "replaced duplicate connection");
                let _ = old.writer.lock().await.shutdown().await;
            }
            None => {
                info!(peer = username, %addr, inbound, "peer connected");
                let _ = self.events.send(PeerEvent::Connected {
                    username: username.to_string(),
                    addr,
                    inbound,
                });
            }
        }
        Some(id)
    }

    /// Deliver each read as one message until EOF, error, timeout or shutdown.
    async fn receive_loop(&self, mut reader: OwnedReadHalf, username: String, id: Uuid) {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            match self.read_chunk(&mut reader, &mut buf).await {
                Some(Ok(0)) | None => break,
                Some(Ok(n)) => {
                    let _ = self.events.send(PeerEvent::Message {
                        from: username.clone(),
                        body: wire::decode_chunk(&buf[..n]),
                    });
                }
                Some(Err(e)) => {
                    debug!(peer = %username, "receive failed: {}", e);
                    break;
                }
            }
        }
        self.close(&username, id).await;
    }

    /// One read, bounded by the read timeout. None when shutdown was signalled.
    async fn read_chunk(
        &self,
        reader: &mut OwnedReadHalf,
        buf: &mut [u8],
    ) -> Option<std::io::Result<usize>> {
        let mut shutdown = self.shutdown.clone();
        let read = async {
            match self.read_timeout {
                Some(limit) => tokio::time::timeout(limit, reader.read(buf))
                    .await
                    .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into())),
                None => reader.read(buf).await,
            }
        };
        tokio::select! {
            r = read => Some(r),
            _ = stopped(&mut shutdown) => None,
        }
    }

    /// Remove our own entry (a newer connection under the same name is left alone) and close it.
    async fn close(&self, username: &str, id: Uuid) {
        let removed = {
            let mut table = self.table.lock().await;
            if table.get(username).is_some_and(|c| c.id == id) {
                table.remove(username)
            } else {
                None
            }
        };
        if let Some(conn) = removed {
            let _ = conn.writer.lock().await.shutdown().await;
            debug!(
                peer = username,
                addr = %conn.addr,
                state = ?ConnectionState::Closed,
                "connection state"
            );
            info!(peer = username, "peer disconnected");
            let _ = self.events.send(PeerEvent::Disconnected {
                username: username.to_string(),
            });
        }
    }

    /// Write `body` to an established connection.
    pub async fn send_direct(&self, target: &str, body: &str) -> Result<(), PeerError> {
        let writer = match self.table.lock().await.get(target) {
            Some(conn) => conn.writer.clone(),
            None => return Err(PeerError::NotConnected(target.to_string())),
        };
        write_body(&writer, body)
            .await
            .map_err(|source| PeerError::Send {
                target: target.to_string(),
                source,
            })
    }

    /// Best-effort write to every established connection. Returns how many succeeded.
    pub async fn broadcast(&self, body: &str) -> usize {
        let targets: Vec<(String, Arc<Mutex<OwnedWriteHalf>>)> = {
            let table = self.table.lock().await;
            table
                .iter()
                .map(|(name, c)| (name.clone(), c.writer.clone()))
                .collect()
        };
        let mut sent = 0;
        for (name, writer) in targets {
            match write_body(&writer, body).await {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %name, "broadcast write failed: {}", e),
            }
        }
        sent
    }

    pub async fn is_connected(&self, username: &str) -> bool {
        self.table.lock().await.contains_key(username)
    }

    /// Usernames with an established connection, sorted.
    pub async fn connected_peers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Whether a new socket to `remote` replaces an existing one: only if it was
/// opened by the smaller of the two usernames.
fn keeps_new(local: &str, remote: &str, inbound: bool) -> bool {
    if inbound {
        remote < local
    } else {
        local < remote
    }
}

async fn write_body(writer: &Mutex<OwnedWriteHalf>, body: &str) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(body.as_bytes()).await?;
    w.flush().await
}

/// Resolves once shutdown is signalled or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

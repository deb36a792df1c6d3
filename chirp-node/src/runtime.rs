//! Peer runtime: listening socket, tracker registration, and the operations a CLI or bridge drives.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use chirp_core::{Directory, Message};
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::client::{ClientError, TrackerClient};
use crate::transport::{ConnectionManager, PeerError, PeerEvent};

const LISTEN_BACKLOG: u32 = 5;

/// Settings for one local identity.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub username: String,
    /// 0 picks an ephemeral port.
    pub listen_port: u16,
    /// IP advertised to the tracker; detected when None.
    pub advertise_ip: Option<String>,
    pub tracker_url: String,
    pub read_timeout: Option<Duration>,
}

/// Result of `join_channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Created,
    Joined,
}

/// Error from a tracker-backed runtime operation.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Tracker(#[from] ClientError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("cannot listen for peers: {0}")]
    Listen(#[source] std::io::Error),
}

/// One running local identity. Dropping it stops its accept and receive loops.
pub struct PeerRuntime {
    username: String,
    advertise_ip: String,
    local_addr: SocketAddr,
    tracker: TrackerClient,
    connections: ConnectionManager,
    shutdown: watch::Sender<bool>,
}

impl PeerRuntime {
    /// Bind the listening socket, start accepting, and hand back the event stream.
    pub async fn start(
        settings: PeerSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), RuntimeError> {
        let tracker = TrackerClient::new(&settings.tracker_url)?;
        let socket = TcpSocket::new_v4().map_err(RuntimeError::Listen)?;
        socket.set_reuseaddr(true).map_err(RuntimeError::Listen)?;
        socket
            .bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.listen_port)))
            .map_err(RuntimeError::Listen)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(RuntimeError::Listen)?;
        let local_addr = listener.local_addr().map_err(RuntimeError::Listen)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connections = ConnectionManager::new(
            &settings.username,
            events_tx,
            settings.read_timeout,
            shutdown_rx,
        );
        tokio::spawn(connections.clone().accept_loop(listener));

        let advertise_ip = settings.advertise_ip.unwrap_or_else(local_ip);
        info!(
            user = %settings.username,
            "listening for peers on {} (advertising {})",
            local_addr,
            advertise_ip
        );
        Ok((
            Self {
                username: settings.username,
                advertise_ip,
                local_addr,
                tracker,
                connections,
                shutdown,
            },
            events_rx,
        ))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn advertise_ip(&self) -> &str {
        &self.advertise_ip
    }

    /// Register (or re-register) this identity with the tracker.
    pub async fn register(&self) -> Result<(), RuntimeError> {
        self.tracker
            .register(&self.username, &self.advertise_ip, self.local_addr.port())
            .await?;
        info!(user = %self.username, tracker = self.tracker.base_url(), "registered with tracker");
        Ok(())
    }

    pub async fn peer_list(&self) -> Result<Directory, RuntimeError> {
        Ok(self.tracker.list().await?)
    }

    /// Create the channel, or join it if it already exists.
    pub async fn join_channel(&self, name: &str) -> Result<JoinOutcome, RuntimeError> {
        match self.tracker.create_channel(name, &self.username).await {
            Ok(()) => return Ok(JoinOutcome::Created),
            Err(ClientError::Rejected { message, .. }) => {
                debug!(channel = name, "create rejected ({}), joining instead", message);
            }
            Err(e) => return Err(e.into()),
        }
        self.tracker.join_channel(name, &self.username).await?;
        Ok(JoinOutcome::Joined)
    }

    /// Queue `body` on the tracker for a peer or every member of a channel.
    pub async fn post(&self, target: &str, body: &str) -> Result<(), RuntimeError> {
        Ok(self.tracker.send_message(&self.username, target, body).await?)
    }

    /// Drain this identity's tracker queue.
    pub async fn inbox(&self) -> Result<Vec<Message>, RuntimeError> {
        Ok(self.tracker.pull_messages(&self.username).await?)
    }

    pub async fn connect(&self, target: &str, ip: &str, port: u16) -> Result<(), RuntimeError> {
        Ok(self.connections.connect(target, ip, port).await?)
    }

    /// Connect to every listed peer not already connected. Returns new connection count.
    pub async fn connect_all(&self) -> Result<usize, RuntimeError> {
        let dir = self.peer_list().await?;
        let mut opened = 0;
        for peer_id in dir.peers.keys() {
            if peer_id == &self.username || self.connections.is_connected(peer_id).await {
                continue;
            }
            let Some((ip, port)) = dir.address_of(peer_id) else {
                debug!(peer = %peer_id, "skipping malformed tracker address");
                continue;
            };
            match self.connections.connect(peer_id, &ip, port).await {
                Ok(()) => opened += 1,
                Err(e) => debug!(peer = %peer_id, "connect-all skipped: {}", e),
            }
        }
        Ok(opened)
    }

    pub async fn send_direct(&self, target: &str, body: &str) -> Result<(), RuntimeError> {
        Ok(self.connections.send_direct(target, body).await?)
    }

    /// Best-effort send to every connected peer. Returns how many writes succeeded.
    pub async fn broadcast(&self, body: &str) -> usize {
        self.connections.broadcast(body).await
    }

    pub async fn connected_peers(&self) -> Vec<String> {
        self.connections.connected_peers().await
    }

    /// Stop accepting and close every receive loop.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for PeerRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Local IP used for outbound traffic; 127.0.0.1 when there is no route.
/// No packet is sent: connecting a UDP socket only picks a source address.
pub fn local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let sock = UdpSocket::bind(("0.0.0.0", 0))?;
        sock.connect(("8.8.8.8", 80))?;
        Ok(sock.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}

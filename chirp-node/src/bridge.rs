//! HTTP bridge hosting several local peer identities, each with its own runtime
//! and connection table. One lock guards the identity registry.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chirp_core::Message;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::http::{self, Request, Response};
use crate::runtime::{PeerRuntime, PeerSettings};
use crate::transport::PeerEvent;

const CORS_HEADERS: [(&str, &str); 4] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "POST, GET, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
    ("Access-Control-Max-Age", "86400"),
];

const DEFAULT_TRACKER_IP: &str = "127.0.0.1";
const DEFAULT_TRACKER_PORT: u16 = 8001;
const RESTART_GRACE: Duration = Duration::from_millis(100);
/// Unpolled direct messages kept per identity; the oldest are dropped first.
const INBOX_CAPACITY: usize = 1000;

type Inbox = Arc<Mutex<VecDeque<Message>>>;

/// A hosted identity: its runtime and the direct messages it has received.
struct Instance {
    runtime: Arc<PeerRuntime>,
    inbox: Inbox,
    collector: JoinHandle<()>,
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.runtime.stop();
        self.collector.abort();
    }
}

pub struct Bridge {
    instances: Mutex<HashMap<String, Instance>>,
    tracker_url: String,
    read_timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
struct InitRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    peer_port: u16,
    tracker_ip: Option<String>,
    tracker_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    peer_username: String,
    #[serde(default)]
    peer_ip: String,
    #[serde(default)]
    peer_port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct JoinRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    channel: String,
}

#[derive(Debug, Default, Deserialize)]
struct SendPeerRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    peer_username: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct UserRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    message: String,
}

impl Bridge {
    /// `tracker_url` is used when `/init-peer` names no tracker.
    pub fn new(tracker_url: &str, read_timeout: Option<Duration>) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            tracker_url: tracker_url.to_string(),
            read_timeout,
        }
    }

    pub async fn active_peers(&self) -> usize {
        self.instances.lock().await.len()
    }

    /// Route one request. OPTIONS on any path answers the CORS preflight.
    pub async fn handle(&self, req: Request) -> Response {
        if req.method == "OPTIONS" {
            return with_cors(Response::empty(200));
        }
        let result = match (req.method.as_str(), req.path.as_str()) {
            ("POST", "/init-peer") => self.init_peer(&req.body).await,
            ("POST", "/connect-peer") => self.connect_peer(&req.body).await,
            ("POST", "/join-channel") => self.join_channel(&req.body).await,
            ("POST", "/send-peer") => self.send_peer(&req.body).await,
            ("POST", "/broadcast-peer") => self.broadcast_peer(&req.body).await,
            ("POST", "/get-messages") => self.get_messages(&req.body).await,
            ("GET", "/status") => Ok(reply(
                200,
                json!({ "status": "online", "active_peers": self.active_peers().await }),
            )),
            (method, path) => {
                let message = format!("No route for {} {}", method, path);
                Ok(reply(404, json!({ "status": "error", "message": message })))
            }
        };
        result.unwrap_or_else(|e| {
            warn!(path = %req.path, "bridge request failed: {}", e);
            reply(500, json!({ "status": "error", "message": e.to_string() }))
        })
    }

    async fn init_peer(&self, body: &[u8]) -> anyhow::Result<Response> {
        let req: InitRequest = parse(body)?;
        if req.username.is_empty() || req.peer_port == 0 {
            return Ok(reply(400, json!({ "status": "failed" })));
        }
        let tracker_url = if req.tracker_ip.is_some() || req.tracker_port.is_some() {
            format!(
                "http://{}:{}",
                req.tracker_ip.as_deref().unwrap_or(DEFAULT_TRACKER_IP),
                req.tracker_port.unwrap_or(DEFAULT_TRACKER_PORT)
            )
        } else {
            self.tracker_url.clone()
        };

        let previous = self.instances.lock().await.remove(&req.username);
        if let Some(previous) = previous {
            info!(user = %req.username, "restarting bridged identity");
            drop(previous);
            // The old accept loop closes its listener asynchronously.
            tokio::time::sleep(RESTART_GRACE).await;
        }
        let (runtime, events) = PeerRuntime::start(PeerSettings {
            username: req.username.clone(),
            listen_port: req.peer_port,
            advertise_ip: Some("127.0.0.1".to_string()),
            tracker_url,
            read_timeout: self.read_timeout,
        })
        .await?;
        let registered = match runtime.register().await {
            Ok(()) => true,
            Err(e) => {
                warn!(user = %req.username, "tracker registration failed: {}", e);
                false
            }
        };
        let inbox = Inbox::default();
        let collector = tokio::spawn(collect_messages(events, inbox.clone()));
        self.instances.lock().await.insert(
            req.username.clone(),
            Instance {
                runtime: Arc::new(runtime),
                inbox,
                collector,
            },
        );
        info!(user = %req.username, port = req.peer_port, "bridged identity initialized");
        Ok(reply(
            200,
            json!({ "status": "success", "message": "Initialized", "registered": registered }),
        ))
    }

    async fn connect_peer(&self, body: &[u8]) -> anyhow::Result<Response> {
        let req: ConnectRequest = parse(body)?;
        let Some(runtime) = self.runtime(&req.username).await else {
            return Ok(not_initialized());
        };
        let ok = match runtime
            .connect(&req.peer_username, &req.peer_ip, req.peer_port)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!(user = %req.username, "connect-peer failed: {}", e);
                false
            }
        };
        Ok(status_reply(ok))
    }

    async fn join_channel(&self, body: &[u8]) -> anyhow::Result<Response> {
        let req: JoinRequest = parse(body)?;
        let Some(runtime) = self.runtime(&req.username).await else {
            return Ok(not_initialized());
        };
        let ok = match runtime.join_channel(&req.channel).await {
            Ok(_) => true,
            Err(e) => {
                debug!(user = %req.username, "join-channel failed: {}", e);
                false
            }
        };
        Ok(status_reply(ok))
    }

    async fn send_peer(&self, body: &[u8]) -> anyhow::Result<Response> {
        let req: SendPeerRequest = parse(body)?;
        let Some(runtime) = self.runtime(&req.username).await else {
            return Ok(not_initialized());
        };
        let ok = match runtime.send_direct(&req.peer_username, &req.message).await {
            Ok(()) => true,
            Err(e) => {
                debug!(user = %req.username, "send-peer failed: {}", e);
                false
            }
        };
        Ok(status_reply(ok))
    }

    async fn broadcast_peer(&self, body: &[u8]) -> anyhow::Result<Response> {
        let req: UserRequest = parse(body)?;
        let Some(runtime) = self.runtime(&req.username).await else {
            return Ok(not_initialized());
        };
        let count = runtime.broadcast(&req.message).await;
        Ok(reply(200, json!({ "status": "success", "count": count })))
    }

    /// Drain the identity's inbox. Unknown identities just have nothing waiting.
    async fn get_messages(&self, body: &[u8]) -> anyhow::Result<Response> {
        let req: UserRequest = parse(body)?;
        let inbox = {
            let instances = self.instances.lock().await;
            instances.get(&req.username).map(|i| i.inbox.clone())
        };
        let messages = match inbox {
            Some(inbox) => std::mem::take(&mut *inbox.lock().await),
            None => VecDeque::new(),
        };
        Ok(reply(200, json!({ "status": "success", "messages": messages })))
    }

    async fn runtime(&self, username: &str) -> Option<Arc<PeerRuntime>> {
        self.instances
            .lock()
            .await
            .get(username)
            .map(|i| i.runtime.clone())
    }
}

/// Bind and serve the bridge API.
pub async fn run_bridge(bind: SocketAddr, bridge: Arc<Bridge>) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("bridge listening on {}", listener.local_addr()?);
    http::serve(listener, move |req| {
        let bridge = bridge.clone();
        async move { bridge.handle(req).await }
    })
    .await
}

async fn collect_messages(mut events: mpsc::UnboundedReceiver<PeerEvent>, inbox: Inbox) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Message { from, body } => {
                let mut inbox = inbox.lock().await;
                if inbox.len() == INBOX_CAPACITY {
                    inbox.pop_front();
                }
                inbox.push_back(Message::new(from, body));
            }
            other => debug!(?other, "bridge peer event"),
        }
    }
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(body)?)
}

fn with_cors(mut resp: Response) -> Response {
    for (k, v) in CORS_HEADERS {
        resp = resp.with_header(k, v);
    }
    resp
}

fn reply(status: u16, value: serde_json::Value) -> Response {
    with_cors(Response::json(status, &value))
}

fn status_reply(ok: bool) -> Response {
    reply(
        200,
        json!({ "status": if ok { "success" } else { "failed" } }),
    )
}

fn not_initialized() -> Response {
    reply(
        400,
        json!({ "status": "failed", "message": "Not initialized" }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::serve_tracker;
    use chirp_core::Tracker;
    use tokio::time::{sleep, timeout};

    async fn spawn_tracker() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_tracker(listener, Arc::new(Mutex::new(Tracker::new()))));
        format!("http://{}", addr)
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn request(method: &str, path: &str, body: serde_json::Value) -> Request {
        Request {
            method: method.into(),
            path: path.into(),
            headers: vec![],
            body: body.to_string().into_bytes(),
        }
    }

    fn body(resp: &Response) -> serde_json::Value {
        serde_json::from_slice(&resp.body).unwrap()
    }

    #[tokio::test]
    async fn preflight_and_status() {
        let bridge = Bridge::new("http://127.0.0.1:1", None);
        let resp = bridge
            .handle(request("OPTIONS", "/send-peer", json!(null)))
            .await;
        assert_eq!(resp.status, 200);
        assert!(resp.body.is_empty());
        assert!(resp
            .headers
            .iter()
            .any(|(k, v)| k == "Access-Control-Allow-Origin" && v == "*"));

        let resp = bridge.handle(request("GET", "/status", json!(null))).await;
        assert_eq!(body(&resp)["status"], "online");
        assert_eq!(body(&resp)["active_peers"], 0);
    }

    #[tokio::test]
    async fn uninitialized_and_bad_requests() {
        let bridge = Bridge::new("http://127.0.0.1:1", None);
        let resp = bridge
            .handle(request("POST", "/init-peer", json!({ "username": "alice" })))
            .await;
        assert_eq!(resp.status, 400);
        assert_eq!(body(&resp)["status"], "failed");

        let resp = bridge
            .handle(request(
                "POST",
                "/send-peer",
                json!({ "username": "ghost", "peer_username": "x", "message": "m" }),
            ))
            .await;
        assert_eq!(resp.status, 400);
        assert_eq!(body(&resp)["message"], "Not initialized");

        let resp = bridge
            .handle(request("POST", "/get-messages", json!({ "username": "ghost" })))
            .await;
        assert_eq!(resp.status, 200);
        assert_eq!(body(&resp)["messages"], json!([]));

        let mut bad = request("POST", "/connect-peer", json!(null));
        bad.body = b"{oops".to_vec();
        let resp = bridge.handle(bad).await;
        assert_eq!(resp.status, 500);
        assert_eq!(body(&resp)["status"], "error");
    }

    #[tokio::test]
    async fn two_identities_exchange_messages() {
        let url = spawn_tracker().await;
        let bridge = Bridge::new(&url, None);
        let alice_port = free_port();
        let bob_port = free_port();

        for (user, port) in [("alice", alice_port), ("bob", bob_port)] {
            let resp = bridge
                .handle(request(
                    "POST",
                    "/init-peer",
                    json!({ "username": user, "peer_port": port }),
                ))
                .await;
            assert_eq!(resp.status, 200, "{:?}", body(&resp));
            assert_eq!(body(&resp)["registered"], true);
        }
        assert_eq!(bridge.active_peers().await, 2);

        let resp = bridge
            .handle(request(
                "POST",
                "/connect-peer",
                json!({
                    "username": "bob",
                    "peer_username": "alice",
                    "peer_ip": "127.0.0.1",
                    "peer_port": alice_port
                }),
            ))
            .await;
        assert_eq!(body(&resp)["status"], "success");

        // Wait for alice to finish the handshake before bob talks.
        let alice = bridge.runtime("alice").await.unwrap();
        timeout(Duration::from_secs(5), async {
            while alice.connected_peers().await.is_empty() {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let resp = bridge
            .handle(request(
                "POST",
                "/send-peer",
                json!({ "username": "bob", "peer_username": "alice", "message": "hi alice" }),
            ))
            .await;
        assert_eq!(body(&resp)["status"], "success");

        let messages = timeout(Duration::from_secs(5), async {
            loop {
                let resp = bridge
                    .handle(request("POST", "/get-messages", json!({ "username": "alice" })))
                    .await;
                let msgs = body(&resp)["messages"].as_array().unwrap().clone();
                if !msgs.is_empty() {
                    return msgs;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(messages[0]["sender"], "bob");
        assert_eq!(messages[0]["message"], "hi alice");

        let resp = bridge
            .handle(request(
                "POST",
                "/broadcast-peer",
                json!({ "username": "alice", "message": "all" }),
            ))
            .await;
        assert_eq!(body(&resp)["count"], 1);

        let resp = bridge
            .handle(request(
                "POST",
                "/join-channel",
                json!({ "username": "alice", "channel": "team" }),
            ))
            .await;
        assert_eq!(body(&resp)["status"], "success");

        let resp = bridge
            .handle(request(
                "POST",
                "/send-peer",
                json!({ "username": "alice", "peer_username": "carol", "message": "x" }),
            ))
            .await;
        assert_eq!(body(&resp)["status"], "failed");
    }

    #[tokio::test]
    async fn inbox_keeps_newest_messages() {
        let inbox = Inbox::default();
        let (tx, rx) = mpsc::unbounded_channel();
        for i in 0..INBOX_CAPACITY + 5 {
            tx.send(PeerEvent::Message {
                from: "bob".into(),
                body: format!("m{i}"),
            })
            .unwrap();
        }
        drop(tx);
        collect_messages(rx, inbox.clone()).await;

        let inbox = inbox.lock().await;
        assert_eq!(inbox.len(), INBOX_CAPACITY);
        assert_eq!(inbox.front().unwrap().body, "m5");
        assert_eq!(
            inbox.back().unwrap().body,
            format!("m{}", INBOX_CAPACITY + 4)
        );
    }

    #[tokio::test]
    async fn registration_does_not_hold_the_registry() {
        // A tracker that accepts, stalls for a second, then hangs up.
        let stalled = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", stalled.local_addr().unwrap());
        tokio::spawn(async move {
            let (conn, _) = stalled.accept().await.unwrap();
            sleep(Duration::from_secs(1)).await;
            drop(conn);
        });
        let bridge = Arc::new(Bridge::new(&url, None));
        let port = free_port();
        let init = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .handle(request(
                        "POST",
                        "/init-peer",
                        json!({ "username": "alice", "peer_port": port }),
                    ))
                    .await
            })
        };
        sleep(Duration::from_millis(100)).await;
        let status = timeout(
            Duration::from_millis(500),
            bridge.handle(request("GET", "/status", json!(null))),
        )
        .await
        .expect("status answered while init-peer was registering");
        assert_eq!(body(&status)["status"], "online");

        let resp = init.await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(body(&resp)["registered"], false);
        assert_eq!(bridge.active_peers().await, 1);
    }
}

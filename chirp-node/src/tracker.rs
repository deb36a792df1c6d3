//! Tracker HTTP API: registration, discovery, channels and polled message queues.

use std::net::SocketAddr;
use std::sync::Arc;

use chirp_core::protocol::{
    error_envelope, success_envelope, ChannelRequest, PullRequest, RegisterRequest, SendRequest,
};
use chirp_core::{Delivery, Tracker, TrackerError};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::http::{self, Request, Response};

/// Tracker state shared by all request tasks. One lock serializes every operation.
pub type SharedTracker = Arc<Mutex<Tracker>>;

/// Bind and serve the tracker API until the listener fails.
pub async fn run_tracker(bind: SocketAddr, tracker: SharedTracker) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("tracker listening on {}", listener.local_addr()?);
    serve_tracker(listener, tracker).await
}

pub async fn serve_tracker(listener: TcpListener, tracker: SharedTracker) -> std::io::Result<()> {
    http::serve(listener, move |req| {
        let tracker = tracker.clone();
        async move { handle(&tracker, req).await }
    })
    .await
}

/// Route one request. Every failure becomes a JSON error envelope.
pub async fn handle(tracker: &SharedTracker, req: Request) -> Response {
    let result = match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/submit-info") => submit_info(tracker, &req.body).await,
        ("GET", "/get-list") => get_list(tracker).await,
        ("POST", "/create-list") => create_list(tracker, &req.body).await,
        ("POST", "/join-list") => join_list(tracker, &req.body).await,
        ("POST", "/send-message") => send_message(tracker, &req.body).await,
        ("POST", "/get-messages") => get_messages(tracker, &req.body).await,
        (method, path) => {
            return Response::json(
                404,
                &error_envelope(&format!("No route for {} {}", method, path)),
            )
        }
    };
    match result {
        Ok(fields) => Response::json(200, &success_envelope(fields)),
        Err(e) => {
            warn!(path = %req.path, "tracker request rejected: {}", e);
            Response::json(e.status_code(), &error_envelope(e.message()))
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, TrackerError> {
    serde_json::from_slice(body)
        .map_err(|e| TrackerError::Validation(format!("Error processing request: {}", e)))
}

async fn submit_info(
    tracker: &SharedTracker,
    body: &[u8],
) -> Result<serde_json::Value, TrackerError> {
    let req: RegisterRequest = parse_body(body)?;
    let mut t = tracker.lock().await;
    t.register(&req.peer_id, &req.ip, req.port)?;
    info!(
        "registered peer {} at {}:{}; total peers {}",
        req.peer_id,
        req.ip,
        req.port,
        t.peer_count()
    );
    Ok(json!({ "peer_id": req.peer_id, "message": "Peer registered" }))
}

async fn get_list(tracker: &SharedTracker) -> Result<serde_json::Value, TrackerError> {
    let dir = tracker.lock().await.list();
    serde_json::to_value(dir).map_err(|e| TrackerError::Internal(e.to_string()))
}

async fn create_list(
    tracker: &SharedTracker,
    body: &[u8],
) -> Result<serde_json::Value, TrackerError> {
    let req: ChannelRequest = parse_body(body)?;
    tracker
        .lock()
        .await
        .create_channel(&req.list_name, &req.peer_id)?;
    info!("channel {} created by {}", req.list_name, req.peer_id);
    Ok(json!({ "list_name": req.list_name, "message": "Channel created and joined" }))
}

async fn join_list(
    tracker: &SharedTracker,
    body: &[u8],
) -> Result<serde_json::Value, TrackerError> {
    let req: ChannelRequest = parse_body(body)?;
    tracker
        .lock()
        .await
        .join_channel(&req.list_name, &req.peer_id)?;
    info!("peer {} joined channel {}", req.peer_id, req.list_name);
    Ok(json!({ "list_name": req.list_name, "message": "Channel joined successfully" }))
}

async fn send_message(
    tracker: &SharedTracker,
    body: &[u8],
) -> Result<serde_json::Value, TrackerError> {
    let req: SendRequest = parse_body(body)?;
    let delivery = tracker
        .lock()
        .await
        .send(&req.sender_id, &req.target_id, &req.message)?;
    match delivery {
        Delivery::Direct => info!("direct message {} -> {}", req.sender_id, req.target_id),
        Delivery::Channel { recipients } => info!(
            "channel message {} -> {} ({} recipients)",
            req.sender_id, req.target_id, recipients
        ),
    }
    Ok(json!({ "message": "Message queued" }))
}

async fn get_messages(
    tracker: &SharedTracker,
    body: &[u8],
) -> Result<serde_json::Value, TrackerError> {
    let req: PullRequest = parse_body(body)?;
    let messages = tracker.lock().await.pull(&req.peer_id)?;
    Ok(json!({ "messages": messages }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> SharedTracker {
        Arc::new(Mutex::new(Tracker::new()))
    }

    fn post(path: &str, body: serde_json::Value) -> Request {
        Request {
            method: "POST".into(),
            path: path.into(),
            headers: vec![],
            body: body.to_string().into_bytes(),
        }
    }

    fn get(path: &str) -> Request {
        Request {
            method: "GET".into(),
            path: path.into(),
            headers: vec![],
            body: vec![],
        }
    }

    fn body(resp: &Response) -> serde_json::Value {
        serde_json::from_slice(&resp.body).unwrap()
    }

    #[tokio::test]
    async fn register_then_list() {
        let t = shared();
        let resp = handle(
            &t,
            post(
                "/submit-info",
                json!({ "peer_id": "alice", "ip": "10.0.0.1", "port": 9001 }),
            ),
        )
        .await;
        assert_eq!(resp.status, 200);
        assert_eq!(body(&resp)["peer_id"], "alice");
        assert_eq!(body(&resp)["status"], "success");

        let resp = handle(&t, get("/get-list")).await;
        assert_eq!(resp.status, 200);
        let b = body(&resp);
        assert_eq!(b["peers"]["alice"], "10.0.0.1:9001");
        assert_eq!(b["lists"]["public"], 1);
    }

    #[tokio::test]
    async fn missing_field_is_400() {
        let t = shared();
        let resp = handle(&t, post("/submit-info", json!({ "peer_id": "alice" }))).await;
        assert_eq!(resp.status, 400);
        let b = body(&resp);
        assert_eq!(b["status"], "error");
        assert!(b["message"].as_str().unwrap().starts_with("Missing"));
    }

    #[tokio::test]
    async fn malformed_json_is_400() {
        let t = shared();
        let mut req = post("/create-list", json!({}));
        req.body = b"{not json".to_vec();
        let resp = handle(&t, req).await;
        assert_eq!(resp.status, 400);
        assert!(body(&resp)["message"]
            .as_str()
            .unwrap()
            .starts_with("Error processing request"));
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let t = shared();
        assert_eq!(handle(&t, get("/nope")).await.status, 404);
        assert_eq!(handle(&t, get("/submit-info")).await.status, 404);
    }

    #[tokio::test]
    async fn channel_flow_over_routes() {
        let t = shared();
        for (id, port) in [("alice", 9001), ("bob", 9002)] {
            let r = handle(
                &t,
                post(
                    "/submit-info",
                    json!({ "peer_id": id, "ip": "127.0.0.1", "port": port }),
                ),
            )
            .await;
            assert_eq!(r.status, 200);
        }
        let r = handle(
            &t,
            post("/create-list", json!({ "list_name": "team", "peer_id": "alice" })),
        )
        .await;
        assert_eq!(body(&r)["list_name"], "team");

        let r = handle(
            &t,
            post("/create-list", json!({ "list_name": "team", "peer_id": "bob" })),
        )
        .await;
        assert_eq!(r.status, 400);
        assert_eq!(body(&r)["message"], "Channel 'team' already exists.");

        let r = handle(
            &t,
            post("/join-list", json!({ "list_name": "team", "peer_id": "bob" })),
        )
        .await;
        assert_eq!(r.status, 200);

        let r = handle(
            &t,
            post(
                "/send-message",
                json!({ "sender_id": "alice", "target_id": "team", "message": "hi" }),
            ),
        )
        .await;
        assert_eq!(body(&r)["message"], "Message queued");

        let r = handle(&t, post("/get-messages", json!({ "peer_id": "bob" }))).await;
        let msgs = body(&r)["messages"].as_array().unwrap().clone();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["sender"], "alice");
        assert_eq!(msgs[0]["message"], "hi");
        assert_eq!(msgs[0]["channel"], "team");

        let r = handle(
            &t,
            post(
                "/send-message",
                json!({ "sender_id": "alice", "target_id": "ghost", "message": "hi" }),
            ),
        )
        .await;
        assert_eq!(r.status, 400);

        let r = handle(&t, post("/get-messages", json!({ "peer_id": "ghost" }))).await;
        assert_eq!(r.status, 400);
        assert_eq!(body(&r)["message"], "Peer ID 'ghost' not found.");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reregister_racing_sends_never_tears_a_queue() {
        let t = shared();
        for (id, port) in [("alice", 9001), ("bob", 9002)] {
            let r = handle(
                &t,
                post(
                    "/submit-info",
                    json!({ "peer_id": id, "ip": "127.0.0.1", "port": port }),
                ),
            )
            .await;
            assert_eq!(r.status, 200);
        }

        let mut tasks = Vec::new();
        for i in 0..50 {
            let t1 = t.clone();
            tasks.push(tokio::spawn(async move {
                let msg = json!({
                    "sender_id": "alice",
                    "target_id": "bob",
                    "message": format!("m{i}"),
                });
                let r = handle(&t1, post("/send-message", msg)).await;
                assert_eq!(r.status, 200);
            }));
            if i == 25 {
                let t = t.clone();
                tasks.push(tokio::spawn(async move {
                    let r = handle(
                        &t,
                        post(
                            "/submit-info",
                            json!({ "peer_id": "bob", "ip": "127.0.0.2", "port": 9102 }),
                        ),
                    )
                    .await;
                    assert_eq!(r.status, 200);
                }));
            }
        }
        for task in tasks {
            task.await.unwrap();
        }

        let r = handle(&t, post("/get-messages", json!({ "peer_id": "bob" }))).await;
        let msgs = body(&r)["messages"].as_array().unwrap().clone();
        assert!(msgs.len() <= 50);
        let mut seen = std::collections::HashSet::new();
        for m in &msgs {
            assert_eq!(m["sender"], "alice");
            let text = m["message"].as_str().unwrap();
            let n: usize = text.strip_prefix('m').unwrap().parse().unwrap();
            assert!(n < 50);
            assert!(seen.insert(n), "duplicate {text}");
        }

        let r = handle(&t, post("/get-messages", json!({ "peer_id": "bob" }))).await;
        assert!(body(&r)["messages"].as_array().unwrap().is_empty());
        let r = handle(&t, get("/get-list")).await;
        assert_eq!(body(&r)["peers"]["bob"], "127.0.0.2:9102");
    }
}

//! HTTP client for the tracker API.

use std::time::Duration;

use chirp_core::protocol::{
    ChannelRequest, ErrorBody, PullRequest, PullResponse, RegisterRequest, SendRequest,
};
use chirp_core::{Directory, Message};
use serde::de::DeserializeOwned;
use serde::Serialize;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Error talking to the tracker.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not reach tracker: {0}")]
    Http(#[from] reqwest::Error),
    /// Tracker answered with a non-200 status.
    #[error("tracker rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Client for one tracker base URL.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    base_url: String,
    client: reqwest::Client,
}

impl TrackerClient {
    pub fn new(tracker_url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: tracker_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /submit-info`
    pub async fn register(&self, peer_id: &str, ip: &str, port: u16) -> Result<(), ClientError> {
        let req = RegisterRequest {
            peer_id: peer_id.to_string(),
            ip: ip.to_string(),
            port,
        };
        self.post::<_, serde_json::Value>("/submit-info", &req)
            .await
            .map(|_| ())
    }

    /// `GET /get-list`
    pub async fn list(&self) -> Result<Directory, ClientError> {
        let resp = self
            .client
            .get(format!("{}/get-list", self.base_url))
            .send()
            .await?;
        decode(resp).await
    }

    /// `POST /create-list`
    pub async fn create_channel(&self, name: &str, peer_id: &str) -> Result<(), ClientError> {
        self.post::<_, serde_json::Value>("/create-list", &channel_request(name, peer_id))
            .await
            .map(|_| ())
    }

    /// `POST /join-list`
    pub async fn join_channel(&self, name: &str, peer_id: &str) -> Result<(), ClientError> {
        self.post::<_, serde_json::Value>("/join-list", &channel_request(name, peer_id))
            .await
            .map(|_| ())
    }

    /// `POST /send-message`: queue for a peer or a channel.
    pub async fn send_message(
        &self,
        sender_id: &str,
        target_id: &str,
        message: &str,
    ) -> Result<(), ClientError> {
        let req = SendRequest {
            sender_id: sender_id.to_string(),
            target_id: target_id.to_string(),
            message: message.to_string(),
        };
        self.post::<_, serde_json::Value>("/send-message", &req)
            .await
            .map(|_| ())
    }

    /// `POST /get-messages`: drain this peer's queue.
    pub async fn pull_messages(&self, peer_id: &str) -> Result<Vec<Message>, ClientError> {
        let req = PullRequest {
            peer_id: peer_id.to_string(),
        };
        let resp: PullResponse = self.post("/get-messages", &req).await?;
        Ok(resp.messages)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        decode(resp).await
    }
}

fn channel_request(name: &str, peer_id: &str) -> ChannelRequest {
    ChannelRequest {
        list_name: name.to_string(),
        peer_id: peer_id.to_string(),
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let text = resp.text().await?;
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.message)
        .unwrap_or(text);
    Err(ClientError::Rejected {
        status: status.as_u16(),
        message,
    })
}

//! Tracker store: peer registry, single-membership channels, per-peer message queues.
//! Host-driven: the host serializes calls (one lock per store) and does all I/O.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::TrackerError;
use crate::protocol::{Directory, Message, PUBLIC_CHANNEL, SYSTEM_SENDER};

/// A registered peer and its pending messages.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub peer_id: String,
    pub ip: String,
    pub port: u16,
    queue: Vec<Message>,
}

impl PeerRecord {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Where a `send` ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for one peer.
    Direct,
    /// Fanned out to a channel; number of member queues written.
    Channel { recipients: usize },
}

/// In-memory tracker state. Every peer_id is in at most one channel.
#[derive(Debug)]
pub struct Tracker {
    peers: BTreeMap<String, PeerRecord>,
    channels: BTreeMap<String, BTreeSet<String>>,
}

impl Tracker {
    pub fn new() -> Self {
        let mut channels = BTreeMap::new();
        channels.insert(PUBLIC_CHANNEL.to_string(), BTreeSet::new());
        Self {
            peers: BTreeMap::new(),
            channels,
        }
    }

    /// Register or re-register a peer. Overwrites any previous record (queue reset)
    /// and moves the peer into the public channel.
    pub fn register(&mut self, peer_id: &str, ip: &str, port: u16) -> Result<(), TrackerError> {
        if peer_id.is_empty() || ip.is_empty() || port == 0 {
            return Err(TrackerError::Validation(
                "Missing 'peer_id', 'ip', or 'port' in JSON body".into(),
            ));
        }
        self.peers.insert(
            peer_id.to_string(),
            PeerRecord {
                peer_id: peer_id.to_string(),
                ip: ip.to_string(),
                port,
                queue: Vec::new(),
            },
        );
        self.leave_all_channels(peer_id);
        self.channels
            .entry(PUBLIC_CHANNEL.to_string())
            .or_default()
            .insert(peer_id.to_string());
        Ok(())
    }

    /// Snapshot of peers ("ip:port") and channel member counts.
    pub fn list(&self) -> Directory {
        Directory {
            peers: self
                .peers
                .iter()
                .map(|(id, rec)| (id.clone(), rec.address()))
                .collect(),
            lists: self
                .channels
                .iter()
                .map(|(name, members)| (name.clone(), members.len()))
                .collect(),
        }
    }

    /// Create a channel with `peer_id` as its only member.
    pub fn create_channel(&mut self, name: &str, peer_id: &str) -> Result<(), TrackerError> {
        if name.is_empty() || peer_id.is_empty() {
            return Err(TrackerError::Validation(
                "Missing 'list_name' or 'peer_id'".into(),
            ));
        }
        if self.channels.contains_key(name) {
            return Err(TrackerError::Conflict(format!(
                "Channel '{}' already exists.",
                name
            )));
        }
        if !self.peers.contains_key(peer_id) {
            return Err(TrackerError::peer_not_registered(peer_id));
        }
        self.leave_all_channels(peer_id);
        self.channels
            .insert(name.to_string(), BTreeSet::from([peer_id.to_string()]));
        Ok(())
    }

    /// Move `peer_id` into an existing channel and queue a join notice to the
    /// members already there.
    pub fn join_channel(&mut self, name: &str, peer_id: &str) -> Result<(), TrackerError> {
        if name.is_empty() || peer_id.is_empty() {
            return Err(TrackerError::Validation(
                "Missing 'list_name' or 'peer_id'".into(),
            ));
        }
        let members = self
            .channels
            .get(name)
            .ok_or_else(|| TrackerError::NotFound(format!("Channel '{}' not found.", name)))?;
        if !self.peers.contains_key(peer_id) {
            return Err(TrackerError::peer_not_registered(peer_id));
        }
        if members.contains(peer_id) {
            return Err(TrackerError::Conflict(format!(
                "Peer ID '{}' already a member of '{}'.",
                peer_id, name
            )));
        }
        self.leave_all_channels(peer_id);
        let notice = Message::new(SYSTEM_SENDER, format!("{} joined the channel.", peer_id))
            .in_channel(name);
        self.fan_out(name, peer_id, &notice);
        self.channels
            .entry(name.to_string())
            .or_default()
            .insert(peer_id.to_string());
        Ok(())
    }

    /// Queue `body` for a peer, or for every member of a channel except the sender.
    /// Peer ids win over channel names when both match.
    pub fn send(
        &mut self,
        sender_id: &str,
        target_id: &str,
        body: &str,
    ) -> Result<Delivery, TrackerError> {
        if sender_id.is_empty() || target_id.is_empty() || body.is_empty() {
            return Err(TrackerError::Validation(
                "Missing sender, target, or message.".into(),
            ));
        }
        let msg = Message::new(sender_id, body);
        if let Some(rec) = self.peers.get_mut(target_id) {
            rec.queue.push(msg);
            return Ok(Delivery::Direct);
        }
        if self.channels.contains_key(target_id) {
            let recipients = self.fan_out(target_id, sender_id, &msg.in_channel(target_id));
            return Ok(Delivery::Channel { recipients });
        }
        Err(TrackerError::NotFound(format!(
            "Target ID '{}' is not a valid Peer or Channel.",
            target_id
        )))
    }

    /// Drain and return a peer's whole queue, oldest first.
    pub fn pull(&mut self, peer_id: &str) -> Result<Vec<Message>, TrackerError> {
        if peer_id.is_empty() {
            return Err(TrackerError::Validation("Missing 'peer_id'.".into()));
        }
        let rec = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| TrackerError::NotFound(format!("Peer ID '{}' not found.", peer_id)))?;
        Ok(std::mem::take(&mut rec.queue))
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Channel the peer currently belongs to, if any.
    pub fn channel_of(&self, peer_id: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|(_, members)| members.contains(peer_id))
            .map(|(name, _)| name.as_str())
    }

    pub fn members(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.channels.get(name)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn leave_all_channels(&mut self, peer_id: &str) {
        for members in self.channels.values_mut() {
            members.remove(peer_id);
        }
    }

    /// Push `msg` to every registered member of `channel` except `skip`.
    fn fan_out(&mut self, channel: &str, skip: &str, msg: &Message) -> usize {
        let Some(members) = self.channels.get(channel) else {
            return 0;
        };
        let mut delivered = 0;
        for member in members.iter().filter(|m| m.as_str() != skip) {
            if let Some(rec) = self.peers.get_mut(member) {
                rec.queue.push(msg.clone());
                delivered += 1;
            }
        }
        delivered
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

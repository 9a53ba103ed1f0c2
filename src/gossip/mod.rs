// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Signed-payload pub/sub over a peer set. Two independent channels
//! (`RateLimit`, `Bloom`) share this implementation; each has its own peer
//! set and fan-out.

pub mod transport;

use crate::error::{GatewayError, GatewayResult};
use crate::identity::crypto::{self, cmix_hash_concat};
use crate::identity::{Id, Kind};
use crate::model::RoundId;
use dashmap::DashSet;
use log::warn;
use rand::seq::IteratorRandom;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use transport::GossipTransport;

pub const DEFAULT_FANOUT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    RateLimit,
    Bloom,
}

impl Channel {
    pub fn tag(&self) -> &'static str {
        match self {
            Channel::RateLimit => "RateLimit",
            Channel::Bloom => "Bloom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipPayload {
    pub round_id: RoundId,
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub tag: String,
    pub origin: Id,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Envelope {
    fn signed_bytes(&self) -> Vec<u8> {
        cmix_hash_concat(&[
            self.tag.as_bytes(),
            &self.origin.to_bytes(),
            &self.payload,
        ])
        .to_vec()
    }
}

/// Verifies `Origin` is a gateway whose node-kind identity appears in
/// `round.Topology`, and that `Signature` checks out against `Origin`'s
/// public key. Returns the parsed payload on success.
pub fn verify_envelope(
    envelope: &Envelope,
    topology: &[Id],
    origin_public_key: &RsaPublicKey,
) -> GatewayResult<GossipPayload> {
    let origin_as_node = envelope.origin.set_kind(Kind::Node);
    if !topology.contains(&origin_as_node) {
        warn!(
            "rejecting gossip envelope: origin {} not in round topology",
            envelope.origin
        );
        return Err(GatewayError::Unauthenticated);
    }

    crypto::verify(
        origin_public_key,
        &envelope.signed_bytes(),
        &envelope.signature,
    )?;

    bincode::deserialize(&envelope.payload)
        .map_err(|e| GatewayError::Invalid(format!("malformed gossip payload: {e}")))
}

/// One gossip channel: a peer set, a fan-out, and a signing identity.
pub struct GossipProtocol {
    channel: Channel,
    local_id: Id,
    signing_key: Arc<crypto::KeyPair>,
    transport: Arc<dyn GossipTransport>,
    peers: DashSet<Id>,
    fanout: usize,
}

impl GossipProtocol {
    pub fn new(
        channel: Channel,
        local_id: Id,
        signing_key: Arc<crypto::KeyPair>,
        transport: Arc<dyn GossipTransport>,
        fanout: usize,
    ) -> Self {
        GossipProtocol {
            channel,
            local_id,
            signing_key,
            transport,
            peers: DashSet::new(),
            fanout,
        }
    }

    pub fn add_peer(&self, peer: Id) {
        self.peers.insert(peer);
    }

    pub fn remove_peer(&self, peer: &Id) {
        self.peers.remove(peer);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Builds the envelope, signs it, and sends to up to `fanout` distinct
    /// peers chosen uniformly at random. Succeeds if at least one peer
    /// accepted; otherwise returns a composite error.
    pub async fn gossip(&self, round_id: RoundId, ids: Vec<i64>) -> GatewayResult<()> {
        let payload = GossipPayload { round_id, ids };
        let payload_bytes =
            bincode::serialize(&payload).map_err(|e| GatewayError::Internal(e.to_string()))?;

        let mut envelope = Envelope {
            tag: self.channel.tag().to_string(),
            origin: self.local_id,
            payload: payload_bytes,
            signature: vec![],
        };
        let mut rng = rand::thread_rng();
        envelope.signature = self.signing_key.sign(&mut rng, &envelope.signed_bytes());

        let targets: Vec<Id> = {
            let mut rng = rand::thread_rng();
            self.peers
                .iter()
                .map(|p| *p)
                .choose_multiple(&mut rng, self.fanout)
        };

        if targets.is_empty() {
            return Err(GatewayError::NoTarget);
        }

        let mut errors = Vec::new();
        let mut successes = 0usize;
        for peer in &targets {
            match self.transport.send(peer, &envelope).await {
                Ok(()) => successes += 1,
                Err(e) => errors.push(format!("{peer}: {e}")),
            }
        }

        if successes > 0 {
            Ok(())
        } else {
            Err(GatewayError::Internal(format!(
                "gossip on {} failed for all {} peer(s): {}",
                self.channel.tag(),
                targets.len(),
                errors.join("; ")
            )))
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }
}

/// Bounded add/remove signals that a dedicated long-lived task drains to
/// keep every channel's peer set in sync, so RPC handlers never block on
/// peer-set mutation directly.
#[derive(Debug, Clone)]
pub enum PeerSignal {
    Add(Id),
    Remove(Id),
}

pub fn spawn_peer_drainer(
    mut rx: tokio::sync::mpsc::Receiver<PeerSignal>,
    protocols: Vec<Arc<GossipProtocol>>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(async move {
        while let Some(signal) = rx.recv().await {
            match signal {
                PeerSignal::Add(peer) => {
                    for protocol in &protocols {
                        protocol.add_peer(peer);
                    }
                }
                PeerSignal::Remove(peer) => {
                    for protocol in &protocols {
                        protocol.remove_peer(&peer);
                    }
                }
            }
        }
    })
}

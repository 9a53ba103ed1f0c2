// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Public RPC surface. Composes the identity, store, buffer, rate limiter,
//! gossip and round-waiter subsystems and owns the round lifecycle as
//! observed (never driven) from the round store.

pub mod types;

use crate::buffer::UnmixedBuffer;
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::gossip::{Channel, Envelope, GossipProtocol, PeerSignal};
use crate::identity::crypto::{cmix_hash_concat, KeyPair};
use crate::identity::{EphemeralId, Id, Kind};
use crate::junk;
use crate::known_rounds::KnownRounds;
use crate::model::{Client, ClientBloomFilter, ClientRound, MixedMessage, Round, RoundId, RoundState};
use crate::rate_limit::RateLimiter;
use crate::round_waiter::RoundEventWaiter;
use crate::storage::GatewayStorage;
use dashmap::DashMap;
use log::{debug, error, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use types::*;

/// Send timeout for every outbound RPC this orchestrator issues (proxy
/// hops, gossip sends, server uploads, notification dispatch).
const SEND_TIMEOUT: Duration = Duration::from_millis(1300);
/// Timeout `ProcessCompletedBatch` allows `WaitForRound` before failing.
const ROUND_WAIT_TIMEOUT: Duration = Duration::from_secs(3);
/// Maximum allowed skew between `now` and a `ClientKeyRequest`'s timestamp.
const CLIENT_KEY_TIMESTAMP_SKEW_NS: i64 = 3 * 60 * 1_000_000_000;

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as i64
}

fn slot_digest(slot: &crate::buffer::UnmixedSlot) -> [u8; 32] {
    cmix_hash_concat(&[
        &slot.sender_id.to_bytes(),
        &slot.payload_a,
        &slot.payload_b,
        &slot.salt,
    ])
}

fn derive_user_id(client_pub_key: &[u8], salt: &[u8]) -> Id {
    let digest = cmix_hash_concat(&[client_pub_key, salt]);
    Id::new(Kind::User, digest)
}

/// Maps a sender's identity fingerprint onto the `i64` key space gossip
/// envelopes carry, taking the leading 8 bytes.
fn bytes_to_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    i64::from_be_bytes(buf)
}

fn compute_epoch(round: &Round, epoch_duration: Duration) -> u32 {
    let ts = round.timestamp_for(RoundState::Queued).unwrap_or(0).max(0) as u64;
    let epoch_ns = epoch_duration.as_nanos().max(1) as u64;
    (ts / epoch_ns) as u32
}

fn build_filter_bits(round_id: RoundId) -> Vec<u8> {
    let mut bloom = bloomfilter::Bloom::new_for_fp_rate(1024, 0.01);
    bloom.set(&round_id);
    bloom.bitmap()
}

async fn upsert_filter(
    storage: &dyn GatewayStorage,
    recipient_int64: i64,
    round: &Round,
    epoch_duration: Duration,
) -> GatewayResult<()> {
    let filter = ClientBloomFilter {
        recipient_id: recipient_int64,
        epoch: compute_epoch(round, epoch_duration),
        first_round: round.id,
        round_range: 0,
        filter: build_filter_bits(round.id),
    };
    storage.upsert_client_bloom_filter(&filter).await
}

pub struct Orchestrator {
    self_id: Id,
    config: Arc<Config>,
    signing_key: Arc<KeyPair>,
    storage: Arc<dyn GatewayStorage>,
    buffer: UnmixedBuffer,
    rate_limiter: Arc<RateLimiter>,
    round_waiter: Arc<RoundEventWaiter>,
    known_rounds: Arc<KnownRounds>,
    gossip_rate_limit: Option<Arc<GossipProtocol>>,
    gossip_bloom: Option<Arc<GossipProtocol>>,
    /// Serializes inbound bloom-gossip handling so filter upserts and
    /// `KnownRounds` mutation form a single critical section, per §5.
    bloom_gossip_lock: tokio::sync::Mutex<()>,
    host_table: DashMap<Id, Option<Arc<dyn GatewayPeerClient>>>,
    /// Notifies `spawn_peer_drainer` of hosts entering/leaving `host_table`,
    /// so both `GossipProtocol`s' peer sets track proxy-peer registration
    /// instead of always starting (and staying) empty.
    peer_tx: Option<tokio::sync::mpsc::Sender<PeerSignal>>,
    mix_server: Arc<dyn MixServerClient>,
    ndf: Arc<dyn Ndf>,
    notification_sender: Option<Arc<dyn NotificationSender>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: Id,
        config: Arc<Config>,
        signing_key: Arc<KeyPair>,
        storage: Arc<dyn GatewayStorage>,
        rate_limiter: Arc<RateLimiter>,
        known_rounds: Arc<KnownRounds>,
        gossip_rate_limit: Option<Arc<GossipProtocol>>,
        gossip_bloom: Option<Arc<GossipProtocol>>,
        peer_tx: Option<tokio::sync::mpsc::Sender<PeerSignal>>,
        mix_server: Arc<dyn MixServerClient>,
        ndf: Arc<dyn Ndf>,
        notification_sender: Option<Arc<dyn NotificationSender>>,
    ) -> Self {
        Orchestrator {
            self_id,
            config,
            signing_key,
            storage,
            buffer: UnmixedBuffer::new(),
            rate_limiter,
            round_waiter: Arc::new(RoundEventWaiter::new()),
            known_rounds,
            gossip_rate_limit,
            gossip_bloom,
            bloom_gossip_lock: tokio::sync::Mutex::new(()),
            host_table: DashMap::new(),
            peer_tx,
            mix_server,
            ndf,
            notification_sender,
        }
    }

    /// Registers (or updates) a sibling gateway for proxy forwarding and
    /// notifies the peer-channel drainer so both gossip channels pick it up.
    pub fn register_host(&self, gateway: Id, client: Option<Arc<dyn GatewayPeerClient>>) {
        let reachable = client.is_some();
        self.host_table.insert(gateway, client);
        if let Some(tx) = &self.peer_tx {
            let signal = if reachable {
                PeerSignal::Add(gateway)
            } else {
                PeerSignal::Remove(gateway)
            };
            if let Err(e) = tx.try_send(signal) {
                warn!("failed to notify gossip peer drainer about host {gateway}: {e}");
            }
        }
    }

    /// Removes a sibling gateway from proxy forwarding and its gossip peer
    /// sets, e.g. once the NDF no longer lists it.
    pub fn deregister_host(&self, gateway: &Id) {
        self.host_table.remove(gateway);
        if let Some(tx) = &self.peer_tx {
            if let Err(e) = tx.try_send(PeerSignal::Remove(*gateway)) {
                warn!("failed to notify gossip peer drainer about host {gateway} removal: {e}");
            }
        }
    }

    pub fn round_waiter(&self) -> &RoundEventWaiter {
        &self.round_waiter
    }

    fn is_self(&self, target: Option<Id>) -> bool {
        match target {
            None => true,
            Some(id) => id == self.self_id,
        }
    }

    fn resolve_peer(&self, target: &Id) -> GatewayResult<Arc<dyn GatewayPeerClient>> {
        match self.host_table.get(target) {
            None => Err(GatewayError::NoTarget),
            Some(entry) => entry.clone().ok_or(GatewayError::NotConnected),
        }
    }

    // ---- RequestClientKey ----------------------------------------------

    pub async fn request_client_key(
        &self,
        req: SignedClientKeyRequest,
    ) -> GatewayResult<SignedKeyResponse> {
        if !self.is_self(req.request.target) {
            let target = req.request.target.expect("checked by is_self");
            let peer = self.resolve_peer(&target)?;
            return tokio::time::timeout(SEND_TIMEOUT, peer.request_client_key(req))
                .await
                .map_err(|_| GatewayError::Timeout)?;
        }

        let inner = &req.request;
        if (now_ns() - inner.request_timestamp_ns).abs() > CLIENT_KEY_TIMESTAMP_SKEW_NS {
            return Err(GatewayError::Invalid(
                "request timestamp outside allowed skew".to_string(),
            ));
        }

        let server_response = tokio::time::timeout(
            SEND_TIMEOUT,
            self.mix_server.request_client_key(inner.clone()),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;

        let mut rng = rand::thread_rng();
        let signature = self
            .signing_key
            .sign(&mut rng, &server_response.response_blob);

        let user_id = derive_user_id(&inner.client_pub_key, &inner.salt);
        let client = Client {
            id: user_id,
            key: server_response.client_gateway_key,
        };

        // Known-bug boundary (kept intentionally, see spec §7): a failure
        // here is swallowed and the caller still gets a success response,
        // relying on the client to retry `RequestClientKey` if its key
        // later turns out not to have been persisted.
        if let Err(e) = self.storage.upsert_client(&client).await {
            warn!("upsert_client failed during RequestClientKey, ignoring: {e}");
        }

        Ok(SignedKeyResponse {
            response_blob: server_response.response_blob,
            gateway_signature: signature,
        })
    }

    // ---- PutMessage / PutManyMessages -----------------------------------

    async fn admit_and_verify(
        &self,
        slot: &crate::buffer::UnmixedSlot,
        ip: &str,
    ) -> GatewayResult<()> {
        let client = self.storage.get_client(&slot.sender_id).await?;
        let mac_inner = cmix_hash_concat(&[&client.key, &slot.salt]);
        let digest = slot_digest(slot);
        let expected = cmix_hash_concat(&[&mac_inner, &digest]);
        if expected.to_vec() != slot.mac {
            return Err(GatewayError::Unauthenticated);
        }

        // Keyed by the same i64 projection gossip envelopes carry, so a
        // credit applied from a sibling's gossip lands on the same bucket
        // as one applied locally.
        let sender_key = bytes_to_i64(slot.sender_id.payload()).to_string();
        if !self.rate_limiter.admit(ip, &sender_key) {
            return Err(GatewayError::RateLimited);
        }
        Ok(())
    }

    async fn batch_size_for(&self, round_id: RoundId) -> u32 {
        match self.storage.get_round(round_id).await {
            Ok(round) => round.batch_size,
            Err(_) => {
                debug!("round {round_id} unknown to store; admitting without a known batch size");
                u32::MAX
            }
        }
    }

    pub async fn put_message(
        &self,
        req: PutMessageRequest,
        ip: &str,
    ) -> GatewayResult<PutMessageResponse> {
        if !self.is_self(req.target) {
            let target = req.target.expect("checked by is_self");
            let peer = self.resolve_peer(&target)?;
            return tokio::time::timeout(SEND_TIMEOUT, peer.put_message(req, ip))
                .await
                .map_err(|_| GatewayError::Timeout)?;
        }

        self.admit_and_verify(&req.slot, ip).await?;
        let batch_size = self.batch_size_for(req.round_id).await;

        match self
            .buffer
            .add_unmixed_message(req.round_id, req.slot, batch_size)
        {
            Ok(()) => Ok(PutMessageResponse {
                accepted: true,
                round_id: req.round_id,
            }),
            Err(GatewayError::Overfull) => Ok(PutMessageResponse {
                accepted: false,
                round_id: req.round_id,
            }),
            Err(e) => Err(e),
        }
    }

    pub async fn put_many_messages(
        &self,
        req: PutManyMessagesRequest,
        ip: &str,
    ) -> GatewayResult<PutMessageResponse> {
        if !self.is_self(req.target) {
            let target = req.target.expect("checked by is_self");
            let peer = self.resolve_peer(&target)?;
            return tokio::time::timeout(SEND_TIMEOUT, peer.put_many_messages(req, ip))
                .await
                .map_err(|_| GatewayError::Timeout)?;
        }

        for slot in &req.slots {
            self.admit_and_verify(slot, ip).await?;
        }

        let batch_size = self.batch_size_for(req.round_id).await;
        match self
            .buffer
            .add_many_unmixed_messages(req.round_id, req.slots, batch_size)
        {
            Ok(()) => Ok(PutMessageResponse {
                accepted: true,
                round_id: req.round_id,
            }),
            Err(GatewayError::Overfull) => Ok(PutMessageResponse {
                accepted: false,
                round_id: req.round_id,
            }),
            Err(e) => Err(e),
        }
    }

    // ---- UploadUnmixedBatch (server-initiated) --------------------------

    pub async fn upload_unmixed_batch(&self, round_info: RoundInfo) -> GatewayResult<()> {
        let Some(batch) = self.buffer.pop_round(round_info.id) else {
            debug!("round {} has no pending batch to upload", round_info.id);
            return Ok(());
        };

        let mut slots: Vec<_> = batch.slots.into_iter().collect();
        let mut msg_num = slots.len() as u32;
        while (slots.len() as u32) < round_info.batch_size {
            slots.push(junk::generate_junk_slot(msg_num, round_info.id));
            msg_num += 1;
        }

        tokio::time::timeout(
            SEND_TIMEOUT,
            self.mix_server.upload_batch(round_info.id, slots),
        )
        .await
        .map_err(|_| GatewayError::Timeout)?
    }

    // ---- ProcessCompletedBatch (server-initiated) -----------------------

    pub async fn process_completed_batch(
        &self,
        slots: Vec<CompletedSlot>,
        round_id: RoundId,
    ) -> GatewayResult<()> {
        let round = match self.storage.get_round(round_id).await {
            Ok(round) if round.state.at_least(RoundState::Queued) => round,
            _ => {
                let (round, timed_out) = self
                    .round_waiter
                    .wait_for_round(
                        round_id,
                        &[RoundState::Queued, RoundState::Realtime, RoundState::Completed],
                        ROUND_WAIT_TIMEOUT,
                    )
                    .await;
                if timed_out {
                    return Err(GatewayError::Timeout);
                }
                round.ok_or(GatewayError::Timeout)?
            }
        };

        let mut recipients = HashSet::new();
        let mut senders = HashSet::new();
        let mut messages = Vec::with_capacity(slots.len());
        let mut notification_entries = Vec::new();

        for (idx, slot) in slots.into_iter().enumerate() {
            if junk::is_dummy_identity_fp(&slot.identity_fp) {
                continue;
            }
            senders.insert(bytes_to_i64(&slot.identity_fp));
            let masked = slot.raw_recipient_id.clear(round.address_space_size);
            if masked.is_dummy() {
                continue;
            }
            recipients.insert(masked.int64());
            messages.push(MixedMessage {
                id: idx as u64,
                round_id,
                recipient_id: masked,
                payload_a: slot.payload_a.clone(),
                payload_b: slot.payload_b.clone(),
            });
            notification_entries.push(NotificationEntry {
                recipient_id: masked,
                payload: slot.payload_a,
            });
        }

        let client_round = ClientRound {
            id: round_id,
            timestamp: round.timestamp_for(RoundState::Queued).unwrap_or(0),
            messages,
        };

        // Store errors here are logged but never abort: the round's output
        // must still be broadcast so peers can learn of it (§7).
        if let Err(e) = self.storage.insert_mixed_messages(&client_round).await {
            error!("failed to persist mixed messages for round {round_id}: {e}");
        }

        self.known_rounds.insert(round_id);
        if let Err(e) = self.known_rounds.save(&self.config.known_rounds_path) {
            error!("failed to persist known rounds after round {round_id}: {e}");
        }

        let recipients: Vec<i64> = recipients.into_iter().collect();
        let senders: Vec<i64> = senders.into_iter().collect();

        // Fan out the two post-batch gossip messages together: rate-limit
        // credits for this batch's senders, retrieval hints for its
        // recipients (§4.E).
        if !self.config.disable_gossip {
            if let Some(rate_limit) = self.gossip_rate_limit.clone() {
                let ids = senders.clone();
                tokio::spawn(async move {
                    if let Err(e) = rate_limit.gossip(round_id, ids).await {
                        warn!("rate-limit gossip for round {round_id} failed: {e}");
                    }
                });
            }
            if let Some(bloom) = self.gossip_bloom.clone() {
                let ids = recipients.clone();
                tokio::spawn(async move {
                    if let Err(e) = bloom.gossip(round_id, ids).await {
                        warn!("bloom gossip for round {round_id} failed: {e}");
                    }
                });
            }
        }

        {
            let storage = self.storage.clone();
            let epoch_duration = self.config.epoch_duration;
            let round = round.clone();
            let ids = recipients.clone();
            tokio::spawn(async move {
                for recipient in ids {
                    if let Err(e) = upsert_filter(storage.as_ref(), recipient, &round, epoch_duration).await {
                        warn!("local filter upsert for recipient {recipient} failed: {e}");
                    }
                }
            });
        }

        if let Some(address) = self.ndf.notification_bot_address() {
            if let Some(sender) = &self.notification_sender {
                let batch = NotificationBatch {
                    entries: notification_entries,
                };
                match tokio::time::timeout(SEND_TIMEOUT, sender.send_batch(&address, batch)).await
                {
                    Ok(Err(e)) => warn!("notification dispatch for round {round_id} failed: {e}"),
                    Err(_) => warn!("notification dispatch for round {round_id} timed out"),
                    Ok(Ok(())) => {}
                }
            }
        }

        Ok(())
    }

    // ---- RequestMessages -------------------------------------------------

    pub async fn request_messages(
        &self,
        req: GetMessagesRequest,
    ) -> GatewayResult<GetMessagesResponse> {
        if !self.is_self(req.target) {
            let target = req.target.expect("checked by is_self");
            let peer = self.resolve_peer(&target)?;
            return tokio::time::timeout(SEND_TIMEOUT, peer.request_messages(req))
                .await
                .map_err(|_| GatewayError::Timeout)?;
        }

        let (messages, has_round) = self
            .storage
            .get_mixed_messages(req.recipient, req.round_id)
            .await?;

        Ok(GetMessagesResponse {
            messages: messages
                .into_iter()
                .map(|m| (m.payload_a, m.payload_b))
                .collect(),
            has_round,
        })
    }

    // ---- RequestHistoricalRounds ------------------------------------------

    pub async fn request_historical_rounds(
        &self,
        req: HistoricalRoundsRequest,
    ) -> GatewayResult<Vec<Round>> {
        if !self.is_self(req.target) {
            let target = req.target.expect("checked by is_self");
            let peer = self.resolve_peer(&target)?;
            return tokio::time::timeout(SEND_TIMEOUT, peer.request_historical_rounds(req))
                .await
                .map_err(|_| GatewayError::Timeout)?;
        }

        // Best-effort: a failed lookup (none present) is an empty result,
        // not an error, since historical reconstruction is never attempted
        // beyond what's locally known (§1 non-goals).
        match self.storage.get_rounds(&req.round_ids).await {
            Ok(rounds) => Ok(rounds),
            Err(GatewayError::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    // ---- Inbound gossip --------------------------------------------------

    pub async fn handle_gossip_envelope(
        &self,
        channel: Channel,
        envelope: Envelope,
    ) -> GatewayResult<()> {
        let peek: crate::gossip::GossipPayload = bincode::deserialize(&envelope.payload)
            .map_err(|e| GatewayError::Invalid(format!("malformed gossip payload: {e}")))?;

        let round = self.storage.get_round(peek.round_id).await?;
        let public_key = self
            .ndf
            .public_key_for(&envelope.origin)
            .ok_or(GatewayError::Unauthenticated)?;

        let payload = crate::gossip::verify_envelope(&envelope, &round.topology, &public_key)?;

        match channel {
            Channel::RateLimit => {
                for sender in &payload.ids {
                    self.rate_limiter.lookup_bucket(&sender.to_string()).add(1);
                }
            }
            Channel::Bloom => {
                let _guard = self.bloom_gossip_lock.lock().await;
                for recipient in &payload.ids {
                    if let Err(e) =
                        upsert_filter(self.storage.as_ref(), *recipient, &round, self.config.epoch_duration)
                            .await
                    {
                        error!("inbound bloom filter upsert failed for recipient {recipient}: {e}");
                    }
                }
                self.known_rounds.insert(payload.round_id);
                if let Err(e) = self.known_rounds.save(&self.config.known_rounds_path) {
                    error!("failed to persist known rounds after gossip: {e}");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::crypto::KeyPair;
    use crate::storage::memory::MemoryStorage;
    use async_trait::async_trait;
    use rand::rngs::OsRng;
    use std::collections::HashMap as StdHashMap;

    struct StubMixServer;

    #[async_trait]
    impl MixServerClient for StubMixServer {
        async fn request_client_key(&self, _req: ClientKeyRequest) -> GatewayResult<ClientKeyResponse> {
            Ok(ClientKeyResponse {
                client_gateway_key: vec![1, 2, 3],
                response_blob: vec![9, 9, 9],
            })
        }

        async fn upload_batch(&self, _round_id: RoundId, _slots: Vec<crate::buffer::UnmixedSlot>) -> GatewayResult<()> {
            Ok(())
        }
    }

    struct StubNdf;

    impl Ndf for StubNdf {
        fn public_key_for(&self, _node: &Id) -> Option<rsa::RsaPublicKey> {
            None
        }
        fn notification_bot_address(&self) -> Option<String> {
            None
        }
        fn host_address(&self, _gateway: &Id) -> Option<String> {
            None
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            cmix_address: "127.0.0.1:1".into(),
            port: 1,
            override_public_ip: None,
            listening_address: "0.0.0.0".parse().unwrap(),
            cert_path: Default::default(),
            key_path: Default::default(),
            cmix_cert_path: Default::default(),
            scheduling_cert_path: Default::default(),
            idf_path: Default::default(),
            db_username: String::new(),
            db_password: String::new(),
            db_name: String::new(),
            db_address: String::new(),
            dev_mode: true,
            disable_gossip: true,
            ignore_client_version: false,
            cleanup_interval: Duration::from_secs(300),
            rate_limit: crate::config::RateLimitConfig {
                capacity: 100,
                leaked_tokens: 1,
                leak_duration: Duration::from_secs(1),
                poll_duration: Duration::from_secs(30),
                bucket_max_age: Duration::from_secs(600),
            },
            gossip: crate::config::GossipConfig {
                buffer_expiration_time: Duration::from_secs(300),
                monitor_thread_frequency: Duration::from_secs(5),
                fanout: 3,
                gateway_channel_len: 128,
            },
            address_space_size: 16,
            epoch_duration: Duration::from_secs(3600),
            known_rounds_path: std::env::temp_dir().join("test_known_rounds.bin"),
        })
    }

    fn test_orchestrator() -> Orchestrator {
        let self_id = Id::new(Kind::Gateway, [1u8; 32]);
        let config = test_config();
        let signing_key = Arc::new(KeyPair::generate(&mut OsRng, 1024).unwrap());
        let storage: Arc<dyn GatewayStorage> = Arc::new(MemoryStorage::new());
        let rate_limiter = Arc::new(RateLimiter::new(crate::rate_limit::RateLimitParams {
            capacity: 100,
            leaked_tokens: 1,
            leak_duration: Duration::from_secs(1),
            poll_duration: Duration::from_secs(30),
            bucket_max_age: Duration::from_secs(600),
        }));
        let known_rounds = Arc::new(KnownRounds::new());
        Orchestrator::new(
            self_id,
            config,
            signing_key,
            storage,
            rate_limiter,
            known_rounds,
            None,
            None,
            None,
            Arc::new(StubMixServer),
            Arc::new(StubNdf),
            None,
        )
    }

    fn signed_slot(client_key: &[u8], sender: Id) -> crate::buffer::UnmixedSlot {
        let salt = vec![7u8; 16];
        let payload_a = vec![1, 2, 3];
        let payload_b = vec![4, 5, 6];
        let mut slot = crate::buffer::UnmixedSlot {
            sender_id: sender,
            payload_a,
            payload_b,
            salt,
            kmacs: vec![],
            mac: vec![],
        };
        let digest = slot_digest(&slot);
        let inner = cmix_hash_concat(&[client_key, &slot.salt]);
        slot.mac = cmix_hash_concat(&[&inner, &digest]).to_vec();
        slot
    }

    #[tokio::test]
    async fn put_message_accepts_valid_mac() {
        let orch = test_orchestrator();
        let sender = Id::new(Kind::User, [5u8; 32]);
        let key = vec![1, 2, 3, 4];
        orch.storage
            .insert_client(&Client { id: sender, key: key.clone() })
            .await
            .unwrap();
        orch.storage
            .upsert_round(&Round {
                id: 1,
                update_id: 1,
                topology: vec![],
                batch_size: 10,
                state: RoundState::Queued,
                timestamps: StdHashMap::new(),
                address_space_size: 16,
                signed_blob: vec![],
            })
            .await
            .unwrap();

        let slot = signed_slot(&key, sender);
        let resp = orch
            .put_message(
                PutMessageRequest {
                    round_id: 1,
                    slot,
                    target: None,
                },
                "127.0.0.1",
            )
            .await
            .unwrap();
        assert!(resp.accepted);
    }

    #[tokio::test]
    async fn put_message_rejects_bad_mac() {
        let orch = test_orchestrator();
        let sender = Id::new(Kind::User, [5u8; 32]);
        let key = vec![1, 2, 3, 4];
        orch.storage
            .insert_client(&Client { id: sender, key: key.clone() })
            .await
            .unwrap();
        let mut slot = signed_slot(&key, sender);
        slot.salt[0] ^= 0xFF;

        let result = orch
            .put_message(
                PutMessageRequest {
                    round_id: 1,
                    slot,
                    target: None,
                },
                "127.0.0.1",
            )
            .await;
        assert!(matches!(result, Err(GatewayError::Unauthenticated)));
    }

    #[tokio::test]
    async fn request_client_key_rejects_stale_timestamp() {
        let orch = test_orchestrator();
        let req = SignedClientKeyRequest {
            request: ClientKeyRequest {
                client_pub_key: vec![1, 2, 3],
                salt: vec![4, 5, 6],
                request_timestamp_ns: 0,
                target: None,
            },
        };
        let result = orch.request_client_key(req).await;
        assert!(matches!(result, Err(GatewayError::Invalid(_))));
    }

    #[tokio::test]
    async fn request_client_key_zeroes_key_before_returning() {
        let orch = test_orchestrator();
        let req = SignedClientKeyRequest {
            request: ClientKeyRequest {
                client_pub_key: vec![1, 2, 3],
                salt: vec![4, 5, 6],
                request_timestamp_ns: now_ns(),
                target: None,
            },
        };
        let resp = orch.request_client_key(req).await.unwrap();
        // SignedKeyResponse has no field carrying the client/gateway key at
        // all -- the type system enforces the "never on an outbound reply"
        // invariant rather than a runtime zeroing step.
        assert_eq!(resp.response_blob, vec![9, 9, 9]);
    }

    #[tokio::test]
    async fn upload_unmixed_batch_pads_with_junk() {
        let orch = test_orchestrator();
        for i in 0..4u8 {
            let sender = Id::new(Kind::User, [i; 32]);
            let key = vec![i];
            orch.storage
                .insert_client(&Client { id: sender, key: key.clone() })
                .await
                .unwrap();
            let slot = signed_slot(&key, sender);
            orch.buffer.add_unmixed_message(10, slot, 10).unwrap();
        }

        orch.upload_unmixed_batch(RoundInfo { id: 10, batch_size: 10 })
            .await
            .unwrap();
        assert_eq!(orch.buffer.len_unmixed(10), 0);
    }

    #[tokio::test]
    async fn process_completed_batch_discards_dummies_and_masked_zero() {
        let orch = test_orchestrator();
        orch.storage
            .upsert_round(&Round {
                id: 20,
                update_id: 1,
                topology: vec![],
                batch_size: 10,
                state: RoundState::Queued,
                timestamps: StdHashMap::new(),
                address_space_size: 4,
                signed_blob: vec![],
            })
            .await
            .unwrap();

        let slots = vec![
            CompletedSlot {
                identity_fp: junk::dummy_identity_fp(),
                raw_recipient_id: EphemeralId(123),
                payload_a: vec![1],
                payload_b: vec![2],
            },
            CompletedSlot {
                identity_fp: vec![1; 32],
                raw_recipient_id: EphemeralId(0b1111), // clears to 0 with space=4
                payload_a: vec![3],
                payload_b: vec![4],
            },
            CompletedSlot {
                identity_fp: vec![1; 32],
                raw_recipient_id: EphemeralId(0b1_0001), // survives masking
                payload_a: vec![5],
                payload_b: vec![6],
            },
        ];

        orch.process_completed_batch(slots, 20).await.unwrap();

        let (messages, has_round) = orch
            .storage
            .get_mixed_messages(EphemeralId(0b1_0000), 20)
            .await
            .unwrap();
        assert!(has_round);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload_a, vec![5]);
    }

    #[tokio::test]
    async fn proxy_forwarding_uses_registered_host() {
        struct EchoPeer;
        #[async_trait]
        impl GatewayPeerClient for EchoPeer {
            async fn request_client_key(&self, _req: SignedClientKeyRequest) -> GatewayResult<SignedKeyResponse> {
                unimplemented!()
            }
            async fn put_message(&self, req: PutMessageRequest, _ip: &str) -> GatewayResult<PutMessageResponse> {
                Ok(PutMessageResponse { accepted: true, round_id: req.round_id })
            }
            async fn put_many_messages(&self, _req: PutManyMessagesRequest, _ip: &str) -> GatewayResult<PutMessageResponse> {
                unimplemented!()
            }
            async fn request_messages(&self, _req: GetMessagesRequest) -> GatewayResult<GetMessagesResponse> {
                unimplemented!()
            }
            async fn request_historical_rounds(&self, _req: HistoricalRoundsRequest) -> GatewayResult<Vec<Round>> {
                unimplemented!()
            }
        }

        let orch = test_orchestrator();
        let sibling = Id::new(Kind::Gateway, [2u8; 32]);
        orch.register_host(sibling, Some(Arc::new(EchoPeer)));

        let sender = Id::new(Kind::User, [5u8; 32]);
        let slot = signed_slot(&[1, 2, 3], sender);
        let resp = orch
            .put_message(
                PutMessageRequest {
                    round_id: 99,
                    slot,
                    target: Some(sibling),
                },
                "127.0.0.1",
            )
            .await
            .unwrap();
        assert!(resp.accepted);
        assert_eq!(resp.round_id, 99);
    }

    #[tokio::test]
    async fn inbound_rate_limit_gossip_credits_same_bucket_as_local_admission() {
        struct FixedKeyNdf(rsa::RsaPublicKey);
        impl Ndf for FixedKeyNdf {
            fn public_key_for(&self, _node: &Id) -> Option<rsa::RsaPublicKey> {
                Some(self.0.clone())
            }
            fn notification_bot_address(&self) -> Option<String> {
                None
            }
            fn host_address(&self, _gateway: &Id) -> Option<String> {
                None
            }
        }

        let origin_keys = KeyPair::generate(&mut OsRng, 1024).unwrap();
        let origin = Id::new(Kind::Gateway, [9u8; 32]);

        let mut config_arc = test_config();
        Arc::make_mut(&mut config_arc).rate_limit.capacity = 1;
        let signing_key = Arc::new(KeyPair::generate(&mut OsRng, 1024).unwrap());
        let storage: Arc<dyn GatewayStorage> = Arc::new(MemoryStorage::new());
        let rate_limiter = Arc::new(RateLimiter::new(crate::rate_limit::RateLimitParams {
            capacity: 1,
            leaked_tokens: 1,
            leak_duration: Duration::from_secs(3600),
            poll_duration: Duration::from_secs(30),
            bucket_max_age: Duration::from_secs(600),
        }));
        let known_rounds = Arc::new(KnownRounds::new());
        let orch = Orchestrator::new(
            Id::new(Kind::Gateway, [1u8; 32]),
            config_arc,
            signing_key,
            storage.clone(),
            rate_limiter,
            known_rounds,
            None,
            None,
            None,
            Arc::new(StubMixServer),
            Arc::new(FixedKeyNdf(origin_keys.public_key().clone())),
            None,
        );

        storage
            .upsert_round(&Round {
                id: 30,
                update_id: 1,
                topology: vec![origin.set_kind(Kind::Node)],
                batch_size: 10,
                state: RoundState::Queued,
                timestamps: StdHashMap::new(),
                address_space_size: 16,
                signed_blob: vec![],
            })
            .await
            .unwrap();

        let sender = Id::new(Kind::User, [7u8; 32]);
        let key = vec![1, 2, 3, 4];
        storage
            .insert_client(&Client { id: sender, key: key.clone() })
            .await
            .unwrap();

        let payload = crate::gossip::GossipPayload {
            round_id: 30,
            ids: vec![bytes_to_i64(sender.payload())],
        };
        let payload_bytes = bincode::serialize(&payload).unwrap();
        let mut envelope = crate::gossip::Envelope {
            tag: "RateLimit".to_string(),
            origin,
            payload: payload_bytes,
            signature: vec![],
        };
        let signed_bytes = cmix_hash_concat(&[
            envelope.tag.as_bytes(),
            &envelope.origin.to_bytes(),
            &envelope.payload,
        ])
        .to_vec();
        envelope.signature = origin_keys.sign(&mut OsRng, &signed_bytes);

        orch.handle_gossip_envelope(Channel::RateLimit, envelope)
            .await
            .unwrap();

        // The inbound gossip filled the sender's one-token bucket; a local
        // admission for the same sender must now be rejected, proving both
        // paths key the bucket identically.
        let slot = signed_slot(&key, sender);
        let result = orch
            .put_message(
                PutMessageRequest {
                    round_id: 30,
                    slot,
                    target: None,
                },
                "127.0.0.1",
            )
            .await;
        assert!(matches!(result, Err(GatewayError::RateLimited)));
    }

    #[tokio::test]
    async fn register_host_adds_peer_through_drainer() {
        use crate::gossip::transport::testing::RecordingTransport;

        let self_id = Id::new(Kind::Gateway, [1u8; 32]);
        let config = test_config();
        let signing_key = Arc::new(KeyPair::generate(&mut OsRng, 1024).unwrap());
        let storage: Arc<dyn GatewayStorage> = Arc::new(MemoryStorage::new());
        let rate_limiter = Arc::new(RateLimiter::new(crate::rate_limit::RateLimitParams {
            capacity: 100,
            leaked_tokens: 1,
            leak_duration: Duration::from_secs(1),
            poll_duration: Duration::from_secs(30),
            bucket_max_age: Duration::from_secs(600),
        }));
        let known_rounds = Arc::new(KnownRounds::new());

        let transport = Arc::new(RecordingTransport::default());
        let rate_limit_gossip = Arc::new(GossipProtocol::new(
            Channel::RateLimit,
            self_id,
            signing_key.clone(),
            transport.clone(),
            3,
        ));
        let bloom_gossip = Arc::new(GossipProtocol::new(
            Channel::Bloom,
            self_id,
            signing_key.clone(),
            transport,
            3,
        ));
        let (peer_tx, peer_rx) = tokio::sync::mpsc::channel(8);
        crate::gossip::spawn_peer_drainer(
            peer_rx,
            vec![rate_limit_gossip.clone(), bloom_gossip.clone()],
        );

        let orch = Orchestrator::new(
            self_id,
            config,
            signing_key,
            storage,
            rate_limiter,
            known_rounds,
            Some(rate_limit_gossip.clone()),
            Some(bloom_gossip.clone()),
            Some(peer_tx),
            Arc::new(StubMixServer),
            Arc::new(StubNdf),
            None,
        );

        let sibling = Id::new(Kind::Gateway, [2u8; 32]);
        struct EchoPeer;
        #[async_trait]
        impl GatewayPeerClient for EchoPeer {
            async fn request_client_key(&self, _req: SignedClientKeyRequest) -> GatewayResult<SignedKeyResponse> {
                unimplemented!()
            }
            async fn put_message(&self, req: PutMessageRequest, _ip: &str) -> GatewayResult<PutMessageResponse> {
                Ok(PutMessageResponse { accepted: true, round_id: req.round_id })
            }
            async fn put_many_messages(&self, _req: PutManyMessagesRequest, _ip: &str) -> GatewayResult<PutMessageResponse> {
                unimplemented!()
            }
            async fn request_messages(&self, _req: GetMessagesRequest) -> GatewayResult<GetMessagesResponse> {
                unimplemented!()
            }
            async fn request_historical_rounds(&self, _req: HistoricalRoundsRequest) -> GatewayResult<Vec<Round>> {
                unimplemented!()
            }
        }
        orch.register_host(sibling, Some(Arc::new(EchoPeer)));

        // register_host only signals the drainer; give its task a turn.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(rate_limit_gossip.peer_count(), 1);
        assert_eq!(bloom_gossip.peer_count(), 1);

        orch.deregister_host(&sibling);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(rate_limit_gossip.peer_count(), 0);
        assert_eq!(bloom_gossip.peer_count(), 0);
    }

    #[tokio::test]
    async fn proxy_forwarding_fails_no_target() {
        let orch = test_orchestrator();
        let unknown = Id::new(Kind::Gateway, [3u8; 32]);
        let sender = Id::new(Kind::User, [5u8; 32]);
        let slot = signed_slot(&[1, 2, 3], sender);
        let result = orch
            .put_message(
                PutMessageRequest {
                    round_id: 99,
                    slot,
                    target: Some(unknown),
                },
                "127.0.0.1",
            )
            .await;
        assert!(matches!(result, Err(GatewayError::NoTarget)));
    }
}

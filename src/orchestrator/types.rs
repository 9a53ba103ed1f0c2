// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Request/response shapes for the client- and server-facing RPC surface,
//! plus the trait seams for collaborators that are out of scope for this
//! crate (the mix server itself, the NDF, sibling gateways, the
//! notification bot).

use crate::buffer::UnmixedSlot;
use crate::error::GatewayResult;
use crate::identity::{EphemeralId, Id};
use crate::model::{Round, RoundId};
use async_trait::async_trait;
use rsa::RsaPublicKey;

#[derive(Debug, Clone)]
pub struct ClientKeyRequest {
    pub client_pub_key: Vec<u8>,
    pub salt: Vec<u8>,
    pub request_timestamp_ns: i64,
    pub target: Option<Id>,
}

#[derive(Debug, Clone)]
pub struct SignedClientKeyRequest {
    pub request: ClientKeyRequest,
}

#[derive(Debug, Clone)]
pub struct ClientKeyResponse {
    /// The shared secret between the client and the mix server. Must never
    /// survive on the value returned to the caller -- see
    /// `Orchestrator::request_client_key`.
    pub client_gateway_key: Vec<u8>,
    pub response_blob: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SignedKeyResponse {
    pub response_blob: Vec<u8>,
    pub gateway_signature: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PutMessageRequest {
    pub round_id: RoundId,
    pub slot: UnmixedSlot,
    pub target: Option<Id>,
}

#[derive(Debug, Clone)]
pub struct PutManyMessagesRequest {
    pub round_id: RoundId,
    pub slots: Vec<UnmixedSlot>,
    pub target: Option<Id>,
}

#[derive(Debug, Clone)]
pub struct PutMessageResponse {
    pub accepted: bool,
    pub round_id: RoundId,
}

#[derive(Debug, Clone)]
pub struct GetMessagesRequest {
    pub recipient: EphemeralId,
    pub round_id: RoundId,
    pub target: Option<Id>,
}

#[derive(Debug, Clone)]
pub struct GetMessagesResponse {
    pub messages: Vec<(Vec<u8>, Vec<u8>)>,
    pub has_round: bool,
}

#[derive(Debug, Clone)]
pub struct HistoricalRoundsRequest {
    pub round_ids: Vec<RoundId>,
    pub target: Option<Id>,
}

#[derive(Debug, Clone)]
pub struct RoundInfo {
    pub id: RoundId,
    pub batch_size: u32,
}

/// A slot as it comes back from the mix server after processing, before the
/// gateway has decided whether it's a dummy or masked-to-zero recipient.
#[derive(Debug, Clone)]
pub struct CompletedSlot {
    /// The sending client's `Id` payload (32 bytes), or all-zero for a junk
    /// slot. Kept through mixing so the gateway can still credit the sender's
    /// rate-limit bucket post-batch.
    pub identity_fp: Vec<u8>,
    pub raw_recipient_id: EphemeralId,
    pub payload_a: Vec<u8>,
    pub payload_b: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NotificationEntry {
    pub recipient_id: EphemeralId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct NotificationBatch {
    pub entries: Vec<NotificationEntry>,
}

/// Sibling gateway, reached only for proxy forwarding. Its wire framing is
/// out of scope (§1); this trait is the seam a transport layer fills in.
#[async_trait]
pub trait GatewayPeerClient: Send + Sync {
    async fn request_client_key(
        &self,
        req: SignedClientKeyRequest,
    ) -> GatewayResult<SignedKeyResponse>;
    async fn put_message(&self, req: PutMessageRequest, ip: &str) -> GatewayResult<PutMessageResponse>;
    async fn put_many_messages(
        &self,
        req: PutManyMessagesRequest,
        ip: &str,
    ) -> GatewayResult<PutMessageResponse>;
    async fn request_messages(&self, req: GetMessagesRequest) -> GatewayResult<GetMessagesResponse>;
    async fn request_historical_rounds(
        &self,
        req: HistoricalRoundsRequest,
    ) -> GatewayResult<Vec<Round>>;
}

/// The mix server this gateway fronts. Its own cryptographic work is out of
/// scope; this trait models only the two contact points the gateway has
/// with it.
#[async_trait]
pub trait MixServerClient: Send + Sync {
    async fn request_client_key(&self, req: ClientKeyRequest) -> GatewayResult<ClientKeyResponse>;
    async fn upload_batch(&self, round_id: RoundId, slots: Vec<UnmixedSlot>) -> GatewayResult<()>;
}

/// Network Definition File accessor: signed, shared directory of nodes and
/// gateways and their public keys, plus the optional notification bot
/// address.
pub trait Ndf: Send + Sync {
    fn public_key_for(&self, node: &Id) -> Option<RsaPublicKey>;
    fn notification_bot_address(&self) -> Option<String>;
    fn host_address(&self, gateway: &Id) -> Option<String>;
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_batch(&self, address: &str, batch: NotificationBatch) -> GatewayResult<()>;
}

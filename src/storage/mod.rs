// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Message & filter store: one trait, two backings. `SqliteStorage` is the
//! durable backend used in production; `MemoryStorage` is a drop-in
//! equivalent used in tests (and optionally in `devMode`). Both must
//! produce identical observable behaviour apart from durability.

pub mod memory;
pub mod sqlite;

use crate::error::GatewayResult;
use crate::identity::Id;
use crate::model::{Client, ClientBloomFilter, ClientRound, MixedMessage, Round, RoundId};
use async_trait::async_trait;

#[async_trait]
pub trait GatewayStorage: Send + Sync {
    async fn insert_client(&self, client: &Client) -> GatewayResult<()>;
    async fn upsert_client(&self, client: &Client) -> GatewayResult<()>;
    async fn get_client(&self, id: &Id) -> GatewayResult<Client>;

    /// Inserts `round` if absent, or replaces the stored round only if
    /// `round.update_id` is strictly greater than the stored one. Never
    /// fails on a stale update; it is simply a no-op.
    async fn upsert_round(&self, round: &Round) -> GatewayResult<()>;
    async fn get_round(&self, id: RoundId) -> GatewayResult<Round>;
    /// Fails `NotFound` only if none of `ids` are present; otherwise returns
    /// whatever subset is present.
    async fn get_rounds(&self, ids: &[RoundId]) -> GatewayResult<Vec<Round>>;

    /// Atomically inserts every message in `client_round`. Fails
    /// `AlreadyExists` if any `(round, recipient, message id)` triple is
    /// already present, in which case none of the messages are inserted.
    async fn insert_mixed_messages(&self, client_round: &ClientRound) -> GatewayResult<()>;

    /// `has_round` is `countByRound(round) > 0`; when it's false the caller
    /// must treat the round as unknown to this gateway, distinct from
    /// "known but empty for this recipient".
    async fn get_mixed_messages(
        &self,
        recipient: crate::identity::EphemeralId,
        round: RoundId,
    ) -> GatewayResult<(Vec<MixedMessage>, bool)>;

    async fn delete_mixed_messages_by_round(&self, round: RoundId) -> GatewayResult<()>;

    async fn upsert_client_bloom_filter(&self, filter: &ClientBloomFilter) -> GatewayResult<()>;

    /// Returns every stored filter for `recipient` whose epoch-implied round
    /// range intersects `[first_round, last_round]`.
    async fn get_client_bloom_filters(
        &self,
        recipient: i64,
        first_round: RoundId,
        last_round: RoundId,
    ) -> GatewayResult<Vec<ClientBloomFilter>>;

    async fn delete_client_filters_before_epoch(&self, epoch: u32) -> GatewayResult<()>;

    async fn insert_epoch(&self, round: RoundId, epoch: u32) -> GatewayResult<()>;
}

fn filter_intersects(filter: &ClientBloomFilter, first_round: RoundId, last_round: RoundId) -> bool {
    let filter_end = filter.first_round + filter.round_range as RoundId;
    filter.first_round <= last_round && filter_end >= first_round
}

#[cfg(test)]
pub(crate) fn assert_store_contract_suite() {
    // Shared property coverage lives in `memory::tests` and `sqlite::tests`,
    // both of which exercise the same scenarios against this trait so the
    // two backends stay behaviourally identical.
}

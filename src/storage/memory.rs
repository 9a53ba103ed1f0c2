// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! In-memory store used for tests and `devMode`. Must be observably
//! equivalent to [`super::sqlite::SqliteStorage`] apart from durability.

use super::{filter_intersects, GatewayStorage};
use crate::error::{GatewayError, GatewayResult};
use crate::identity::{EphemeralId, Id};
use crate::model::{Client, ClientBloomFilter, ClientRound, MixedMessage, Round, RoundId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStorage {
    clients: DashMap<Id, Client>,
    rounds: DashMap<RoundId, Round>,
    // (round, recipient) -> (msg id -> message)
    messages: Mutex<HashMap<(RoundId, EphemeralId), HashMap<u64, MixedMessage>>>,
    // (recipient, epoch) -> filter
    filters: DashMap<(i64, u32), ClientBloomFilter>,
    epochs: DashMap<RoundId, u32>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GatewayStorage for MemoryStorage {
    async fn insert_client(&self, client: &Client) -> GatewayResult<()> {
        if self.clients.contains_key(&client.id) {
            return Err(GatewayError::AlreadyExists);
        }
        self.clients.insert(client.id, client.clone());
        Ok(())
    }

    async fn upsert_client(&self, client: &Client) -> GatewayResult<()> {
        self.clients.insert(client.id, client.clone());
        Ok(())
    }

    async fn get_client(&self, id: &Id) -> GatewayResult<Client> {
        self.clients
            .get(id)
            .map(|entry| entry.clone())
            .ok_or(GatewayError::NotFound)
    }

    async fn upsert_round(&self, round: &Round) -> GatewayResult<()> {
        match self.rounds.get(&round.id) {
            Some(existing) if existing.update_id >= round.update_id => {}
            _ => {
                self.rounds.insert(round.id, round.clone());
            }
        }
        Ok(())
    }

    async fn get_round(&self, id: RoundId) -> GatewayResult<Round> {
        self.rounds.get(&id).map(|e| e.clone()).ok_or(GatewayError::NotFound)
    }

    async fn get_rounds(&self, ids: &[RoundId]) -> GatewayResult<Vec<Round>> {
        let found: Vec<Round> = ids
            .iter()
            .filter_map(|id| self.rounds.get(id).map(|e| e.clone()))
            .collect();
        if found.is_empty() {
            return Err(GatewayError::NotFound);
        }
        Ok(found)
    }

    async fn insert_mixed_messages(&self, client_round: &ClientRound) -> GatewayResult<()> {
        let mut guard = self.messages.lock().expect("message store lock poisoned");
        // check-then-insert, all-or-nothing
        for msg in &client_round.messages {
            let key = (msg.round_id, msg.recipient_id);
            if let Some(existing) = guard.get(&key) {
                if existing.contains_key(&msg.id) {
                    return Err(GatewayError::AlreadyExists);
                }
            }
        }
        for msg in &client_round.messages {
            let key = (msg.round_id, msg.recipient_id);
            guard.entry(key).or_default().insert(msg.id, msg.clone());
        }
        Ok(())
    }

    async fn get_mixed_messages(
        &self,
        recipient: EphemeralId,
        round: RoundId,
    ) -> GatewayResult<(Vec<MixedMessage>, bool)> {
        let guard = self.messages.lock().expect("message store lock poisoned");
        let has_round = guard.keys().any(|(r, _)| *r == round);
        let messages = guard
            .get(&(round, recipient))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        Ok((messages, has_round))
    }

    async fn delete_mixed_messages_by_round(&self, round: RoundId) -> GatewayResult<()> {
        let mut guard = self.messages.lock().expect("message store lock poisoned");
        guard.retain(|(r, _), _| *r != round);
        Ok(())
    }

    async fn upsert_client_bloom_filter(&self, filter: &ClientBloomFilter) -> GatewayResult<()> {
        let key = (filter.recipient_id, filter.epoch);
        match self.filters.get_mut(&key) {
            Some(mut existing) => existing.merge(filter),
            None => {
                self.filters.insert(key, filter.clone());
            }
        }
        Ok(())
    }

    async fn get_client_bloom_filters(
        &self,
        recipient: i64,
        first_round: RoundId,
        last_round: RoundId,
    ) -> GatewayResult<Vec<ClientBloomFilter>> {
        Ok(self
            .filters
            .iter()
            .filter(|entry| entry.key().0 == recipient)
            .map(|entry| entry.value().clone())
            .filter(|f| filter_intersects(f, first_round, last_round))
            .collect())
    }

    async fn delete_client_filters_before_epoch(&self, epoch: u32) -> GatewayResult<()> {
        self.filters.retain(|(_, e), _| *e >= epoch);
        Ok(())
    }

    async fn insert_epoch(&self, round: RoundId, epoch: u32) -> GatewayResult<()> {
        self.epochs.insert(round, epoch);
        Ok(())
    }
}

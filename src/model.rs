// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Core data model shared by the store, the buffer and the orchestrator.

use crate::identity::{EphemeralId, Id};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type RoundId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoundState {
    Pending,
    Precomputing,
    Standby,
    Queued,
    Realtime,
    Completed,
    Failed,
}

impl RoundState {
    /// Lifecycle ordering used by `ProcessCompletedBatch`'s `state >= Queued`
    /// guard. `Failed` has no defined ordinal relative to the happy path and
    /// always compares as "not reached" for that guard.
    pub fn at_least(&self, target: RoundState) -> bool {
        fn rank(s: RoundState) -> Option<u8> {
            match s {
                RoundState::Pending => Some(0),
                RoundState::Precomputing => Some(1),
                RoundState::Standby => Some(2),
                RoundState::Queued => Some(3),
                RoundState::Realtime => Some(4),
                RoundState::Completed => Some(5),
                RoundState::Failed => None,
            }
        }
        match (rank(*self), rank(target)) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub update_id: u64,
    pub topology: Vec<Id>,
    pub batch_size: u32,
    pub state: RoundState,
    pub timestamps: HashMap<String, i64>,
    pub address_space_size: u32,
    pub signed_blob: Vec<u8>,
}

impl Round {
    pub fn timestamp_for(&self, state: RoundState) -> Option<i64> {
        self.timestamps.get(state_key(state)).copied()
    }

    pub fn set_timestamp(&mut self, state: RoundState, ns: i64) {
        self.timestamps.insert(state_key(state).to_string(), ns);
    }
}

fn state_key(state: RoundState) -> &'static str {
    match state {
        RoundState::Pending => "PENDING",
        RoundState::Precomputing => "PRECOMPUTING",
        RoundState::Standby => "STANDBY",
        RoundState::Queued => "QUEUED",
        RoundState::Realtime => "REALTIME",
        RoundState::Completed => "COMPLETED",
        RoundState::Failed => "FAILED",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: Id,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedMessage {
    pub id: u64,
    pub round_id: RoundId,
    pub recipient_id: EphemeralId,
    pub payload_a: Vec<u8>,
    pub payload_b: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ClientRound {
    pub id: RoundId,
    pub timestamp: i64,
    pub messages: Vec<MixedMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientBloomFilter {
    pub recipient_id: i64,
    pub epoch: u32,
    pub first_round: RoundId,
    pub round_range: u32,
    pub filter: Vec<u8>,
}

impl ClientBloomFilter {
    /// OR-merges `other` into `self` per the upsert policy in §3: filter
    /// bits OR together, `first_round` takes the min, and `round_range` is
    /// recomputed from the union of the two `[first_round, first_round +
    /// round_range]` intervals (the open question in §9 resolved this way).
    pub fn merge(&mut self, other: &ClientBloomFilter) {
        debug_assert_eq!(self.recipient_id, other.recipient_id);
        debug_assert_eq!(self.epoch, other.epoch);

        let self_end = self.first_round + self.round_range as RoundId;
        let other_end = other.first_round + other.round_range as RoundId;

        let new_first = self.first_round.min(other.first_round);
        let new_end = self_end.max(other_end);
        self.round_range = (new_end - new_first) as u32;
        self.first_round = new_first;

        if self.filter.len() < other.filter.len() {
            self.filter.resize(other.filter.len(), 0);
        }
        for (byte, other_byte) in self.filter.iter_mut().zip(other.filter.iter()) {
            *byte |= other_byte;
        }
    }
}

// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Round-keyed in-memory batch builder. One `RoundBatch` is open per
//! `RoundId` at a time; slots are FIFO within a round, with no ordering
//! guarantee across rounds.

use crate::error::{GatewayError, GatewayResult};
use crate::identity::Id;
use crate::model::RoundId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct UnmixedSlot {
    pub sender_id: Id,
    pub payload_a: Vec<u8>,
    pub payload_b: Vec<u8>,
    pub salt: Vec<u8>,
    pub kmacs: Vec<Vec<u8>>,
    pub mac: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    RealTime,
}

#[derive(Debug)]
pub struct RoundBatch {
    pub round_id: RoundId,
    pub from_phase: BatchPhase,
    pub slots: VecDeque<UnmixedSlot>,
    pub batch_size: Option<u32>,
}

impl RoundBatch {
    fn new(round_id: RoundId) -> Self {
        RoundBatch {
            round_id,
            from_phase: BatchPhase::RealTime,
            slots: VecDeque::new(),
            batch_size: None,
        }
    }
}

/// Round-keyed ingestion queue. All operations lock the whole map briefly;
/// the `parking_lot::Mutex` is uncontended in the common case since most
/// traffic for a round concentrates in a short window.
pub struct UnmixedBuffer {
    batches: Mutex<HashMap<RoundId, RoundBatch>>,
}

impl Default for UnmixedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl UnmixedBuffer {
    pub fn new() -> Self {
        UnmixedBuffer {
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Appends `slot` to `round`'s batch, opening one if it doesn't exist
    /// yet. The first caller to supply `batch_size` fixes the round's
    /// capacity for the `Overfull` check; later callers' `batch_size` is
    /// ignored.
    pub fn add_unmixed_message(
        &self,
        round: RoundId,
        slot: UnmixedSlot,
        batch_size: u32,
    ) -> GatewayResult<()> {
        let mut guard = self.batches.lock();
        let batch = guard.entry(round).or_insert_with(|| RoundBatch::new(round));
        if batch.batch_size.is_none() {
            batch.batch_size = Some(batch_size);
        }
        let limit = batch.batch_size.unwrap_or(batch_size);
        if batch.slots.len() as u32 == limit {
            return Err(GatewayError::Overfull);
        }
        batch.slots.push_back(slot);
        Ok(())
    }

    /// All-or-nothing: if appending every slot in `slots` would overfill the
    /// round's batch, none are appended.
    pub fn add_many_unmixed_messages(
        &self,
        round: RoundId,
        slots: Vec<UnmixedSlot>,
        batch_size: u32,
    ) -> GatewayResult<()> {
        let mut guard = self.batches.lock();
        let batch = guard.entry(round).or_insert_with(|| RoundBatch::new(round));
        if batch.batch_size.is_none() {
            batch.batch_size = Some(batch_size);
        }
        let limit = batch.batch_size.unwrap_or(batch_size);
        if batch.slots.len() as u32 + slots.len() as u32 > limit {
            return Err(GatewayError::Overfull);
        }
        batch.slots.extend(slots);
        Ok(())
    }

    /// Removes and returns the round's batch. Idempotent: a second call
    /// returns `None`.
    pub fn pop_round(&self, round: RoundId) -> Option<RoundBatch> {
        self.batches.lock().remove(&round)
    }

    pub fn len_unmixed(&self, round: RoundId) -> usize {
        self.batches
            .lock()
            .get(&round)
            .map(|b| b.slots.len())
            .unwrap_or(0)
    }

    /// Removes and returns between `min_count` and `max_count` slots,
    /// FIFO, from `round`'s batch. Returns `None` without mutating if fewer
    /// than `min_count` are present.
    pub fn pop_unmixed_messages(
        &self,
        round: RoundId,
        min_count: usize,
        max_count: usize,
    ) -> Option<Vec<UnmixedSlot>> {
        let mut guard = self.batches.lock();
        let batch = guard.get_mut(&round)?;
        if batch.slots.len() < min_count {
            return None;
        }
        let take = max_count.min(batch.slots.len());
        Some(batch.slots.drain(..take).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Kind;

    fn slot() -> UnmixedSlot {
        UnmixedSlot {
            sender_id: Id::new(Kind::User, [1u8; 32]),
            payload_a: vec![1],
            payload_b: vec![2],
            salt: vec![0],
            kmacs: vec![],
            mac: vec![],
        }
    }

    #[test]
    fn fifo_within_round() {
        let buf = UnmixedBuffer::new();
        for i in 0..3u8 {
            let mut s = slot();
            s.payload_a = vec![i];
            buf.add_unmixed_message(1, s, 10).unwrap();
        }
        let popped = buf.pop_unmixed_messages(1, 3, 3).unwrap();
        assert_eq!(popped[0].payload_a, vec![0]);
        assert_eq!(popped[2].payload_a, vec![2]);
    }

    #[test]
    fn overfull_rejects_past_batch_size() {
        let buf = UnmixedBuffer::new();
        buf.add_unmixed_message(1, slot(), 1).unwrap();
        assert!(matches!(
            buf.add_unmixed_message(1, slot(), 1),
            Err(GatewayError::Overfull)
        ));
    }

    #[test]
    fn add_many_is_all_or_nothing() {
        let buf = UnmixedBuffer::new();
        let slots = vec![slot(), slot(), slot()];
        assert!(matches!(
            buf.add_many_unmixed_messages(1, slots, 2),
            Err(GatewayError::Overfull)
        ));
        assert_eq!(buf.len_unmixed(1), 0);
    }

    #[test]
    fn pop_round_is_idempotent() {
        let buf = UnmixedBuffer::new();
        buf.add_unmixed_message(1, slot(), 10).unwrap();
        assert!(buf.pop_round(1).is_some());
        assert!(buf.pop_round(1).is_none());
    }

    #[test]
    fn pop_unmixed_messages_returns_none_below_min() {
        let buf = UnmixedBuffer::new();
        buf.add_unmixed_message(1, slot(), 10).unwrap();
        assert!(buf.pop_unmixed_messages(1, 2, 5).is_none());
        assert_eq!(buf.len_unmixed(1), 1);
    }
}

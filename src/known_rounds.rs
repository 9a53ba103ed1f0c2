// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Append-only set of rounds this gateway has processed, locally or via
//! gossip. Persisted as a bit vector offset from the lowest round id seen,
//! which in practice compresses extremely well since rounds are processed
//! roughly in order.

use crate::error::GatewayResult;
use crate::model::RoundId;
use bit_vec::BitVec;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize)]
struct KnownRoundsSnapshot {
    base: RoundId,
    bits: Vec<u8>,
    len: usize,
}

pub struct KnownRounds {
    inner: RwLock<Inner>,
}

struct Inner {
    base: RoundId,
    bits: BitVec,
}

impl Default for KnownRounds {
    fn default() -> Self {
        Self::new()
    }
}

impl KnownRounds {
    pub fn new() -> Self {
        KnownRounds {
            inner: RwLock::new(Inner {
                base: 0,
                bits: BitVec::new(),
            }),
        }
    }

    pub fn contains(&self, round: RoundId) -> bool {
        let inner = self.inner.read();
        if inner.bits.is_empty() || round < inner.base {
            return false;
        }
        let offset = (round - inner.base) as usize;
        offset < inner.bits.len() && inner.bits.get(offset).unwrap_or(false)
    }

    pub fn insert(&self, round: RoundId) {
        let mut inner = self.inner.write();
        if inner.bits.is_empty() {
            inner.base = round;
            inner.bits.push(true);
            return;
        }
        if round < inner.base {
            // shift everything up so `round` becomes the new base
            let shift = (inner.base - round) as usize;
            let mut shifted = BitVec::from_elem(inner.bits.len() + shift, false);
            for (i, bit) in inner.bits.iter().enumerate() {
                shifted.set(i + shift, bit);
            }
            shifted.set(0, true);
            inner.bits = shifted;
            inner.base = round;
            return;
        }
        let offset = (round - inner.base) as usize;
        if offset >= inner.bits.len() {
            inner.bits.grow(offset + 1 - inner.bits.len(), false);
        }
        inner.bits.set(offset, true);
    }

    pub fn save(&self, path: &Path) -> GatewayResult<()> {
        let inner = self.inner.read();
        let snapshot = KnownRoundsSnapshot {
            base: inner.base,
            bits: inner.bits.to_bytes(),
            len: inner.bits.len(),
        };
        let encoded = bincode::serialize(&snapshot)?;
        std::fs::write(path, encoded)?;
        Ok(())
    }

    pub fn load(path: &Path) -> GatewayResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = std::fs::read(path)?;
        let snapshot: KnownRoundsSnapshot = bincode::deserialize(&bytes)?;
        let mut bits = BitVec::from_bytes(&snapshot.bits);
        bits.truncate(snapshot.len);
        Ok(KnownRounds {
            inner: RwLock::new(Inner {
                base: snapshot.base,
                bits,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insert_then_contains() {
        let kr = KnownRounds::new();
        kr.insert(10);
        kr.insert(12);
        assert!(kr.contains(10));
        assert!(kr.contains(12));
        assert!(!kr.contains(11));
        assert!(!kr.contains(9));
    }

    #[test]
    fn insert_below_base_shifts_correctly() {
        let kr = KnownRounds::new();
        kr.insert(10);
        kr.insert(5);
        assert!(kr.contains(5));
        assert!(kr.contains(10));
        assert!(!kr.contains(7));
    }

    #[test]
    fn persists_across_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_rounds.bin");
        let kr = KnownRounds::new();
        kr.insert(1);
        kr.insert(100);
        kr.save(&path).unwrap();

        let loaded = KnownRounds::load(&path).unwrap();
        assert!(loaded.contains(1));
        assert!(loaded.contains(100));
        assert!(!loaded.contains(50));
    }

    #[test]
    fn load_missing_file_yields_empty_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.bin");
        let loaded = KnownRounds::load(&path).unwrap();
        assert!(!loaded.contains(1));
    }
}

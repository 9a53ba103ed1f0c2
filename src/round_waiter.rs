// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Bounded wait for a round to reach a required lifecycle state.

use crate::model::{Round, RoundState};
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::watch;

/// Per-round broadcast of the latest known [`Round`]. The orchestrator
/// calls `notify` whenever it observes (locally or via gossip) a round
/// transition; `wait_for_round` subscribes and resolves as soon as a
/// target state is seen, or on timeout.
pub struct RoundEventWaiter {
    channels: DashMap<u64, watch::Sender<Option<Round>>>,
}

impl Default for RoundEventWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundEventWaiter {
    pub fn new() -> Self {
        RoundEventWaiter {
            channels: DashMap::new(),
        }
    }

    fn channel_for(&self, round_id: u64) -> watch::Sender<Option<Round>> {
        self.channels
            .entry(round_id)
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    pub fn notify(&self, round: Round) {
        let sender = self.channel_for(round.id);
        let _ = sender.send(Some(round));
    }

    /// Resolves immediately if a previously-notified state already
    /// satisfies `targets`. Otherwise waits up to `timeout` for a matching
    /// transition. Returns `(round, false)` on success, or
    /// `(last_seen, true)` on timeout.
    pub async fn wait_for_round(
        &self,
        round_id: u64,
        targets: &[RoundState],
        timeout: Duration,
    ) -> (Option<Round>, bool) {
        let sender = self.channel_for(round_id);
        let mut receiver = sender.subscribe();

        if let Some(round) = receiver.borrow().clone() {
            if targets.contains(&round.state) {
                return (Some(round), false);
            }
        }

        let wait = async {
            loop {
                if receiver.changed().await.is_err() {
                    return None;
                }
                let current = receiver.borrow().clone();
                if let Some(round) = &current {
                    if targets.contains(&round.state) {
                        return current;
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(round)) => (Some(round), false),
            Ok(None) => (receiver.borrow().clone(), true),
            Err(_) => (receiver.borrow().clone(), true),
        }
    }
}

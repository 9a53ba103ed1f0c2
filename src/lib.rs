// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! cMix gateway: the client-facing edge of the mixnet. A gateway buffers
//! unmixed client traffic for the round currently open, hands batches to its
//! mix server, stores the mixed output, and replicates rate-limit and
//! retrieval-hint state to its siblings over gossip.

pub mod buffer;
pub mod config;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod junk;
pub mod known_rounds;
pub mod model;
pub mod orchestrator;
pub mod rate_limit;
pub mod round_waiter;
pub mod storage;

pub use error::{GatewayError, GatewayResult};
pub use orchestrator::Orchestrator;

// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Seam between the gossip protocol and the actual network transport. The
//! wire framing of inter-gateway RPCs is explicitly out of scope (§1); this
//! trait is where a real binary would plug in its gRPC/HTTP client.

use super::Envelope;
use crate::error::GatewayResult;
use crate::identity::Id;
use async_trait::async_trait;

#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn send(&self, peer: &Id, envelope: &Envelope) -> GatewayResult<()>;
}

/// Test double that records every envelope it was asked to deliver instead
/// of performing any I/O.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<(Id, Envelope)>>,
        pub fail_for: Mutex<Vec<Id>>,
    }

    #[async_trait]
    impl GossipTransport for RecordingTransport {
        async fn send(&self, peer: &Id, envelope: &Envelope) -> GatewayResult<()> {
            if self.fail_for.lock().contains(peer) {
                return Err(crate::error::GatewayError::NotConnected);
            }
            self.sent.lock().push((*peer, envelope.clone()));
            Ok(())
        }
    }
}

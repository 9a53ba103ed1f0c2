// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use log::{error, info};
use nym_gateway::config::{Cli, Config};
use nym_gateway::error::GatewayResult;
use nym_gateway::gossip::{spawn_peer_drainer, Channel, GossipProtocol};
use nym_gateway::identity::crypto::KeyPair;
use nym_gateway::identity::{Id, Kind};
use nym_gateway::known_rounds::KnownRounds;
use nym_gateway::rate_limit::{RateLimitParams, RateLimiter};
use nym_gateway::storage::memory::MemoryStorage;
use nym_gateway::storage::sqlite::SqliteStorage;
use nym_gateway::storage::GatewayStorage;
use nym_gateway::Orchestrator;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let cli = Cli::parse();
    let config = match Config::load_from_file(&cli.config) {
        Ok(config) => cli.apply(config),
        Err(e) => {
            error!("fatal: could not load configuration from {:?}: {e}", cli.config);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("fatal: gateway exited with an error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> GatewayResult<()> {
    let config = Arc::new(config);
    info!("starting gateway on port {}", config.port);

    let storage: Arc<dyn GatewayStorage> = if config.dev_mode {
        info!("dev_mode enabled: using in-memory storage, nothing will survive a restart");
        Arc::new(MemoryStorage::new())
    } else {
        Arc::new(SqliteStorage::connect(&config.db_address).await?)
    };

    let known_rounds = Arc::new(
        KnownRounds::load(&config.known_rounds_path)
            .unwrap_or_else(|e| {
                error!("could not load known rounds from disk, starting empty: {e}");
                KnownRounds::new()
            }),
    );

    let mut rng = rand::rngs::OsRng;
    let signing_key = Arc::new(KeyPair::generate(&mut rng, 2048)?);
    let self_id = Id::new(Kind::Gateway, signing_key.public_key_fingerprint());

    let rate_limiter = Arc::new(RateLimiter::new(RateLimitParams {
        capacity: config.rate_limit.capacity,
        leaked_tokens: config.rate_limit.leaked_tokens,
        leak_duration: config.rate_limit.leak_duration,
        poll_duration: config.rate_limit.poll_duration,
        bucket_max_age: config.rate_limit.bucket_max_age,
    }));
    let _reaper = rate_limiter.clone().spawn_reaper();

    let (gossip_rate_limit, gossip_bloom, peer_tx) = if config.disable_gossip {
        info!("gossip disabled by configuration");
        (None, None, None)
    } else {
        let transport: Arc<dyn nym_gateway::gossip::transport::GossipTransport> =
            Arc::new(UnconfiguredTransport);
        let rate_limit = Arc::new(GossipProtocol::new(
            Channel::RateLimit,
            self_id,
            signing_key.clone(),
            transport.clone(),
            config.gossip.fanout,
        ));
        let bloom = Arc::new(GossipProtocol::new(
            Channel::Bloom,
            self_id,
            signing_key.clone(),
            transport,
            config.gossip.fanout,
        ));
        let (peer_tx, peer_rx) = tokio::sync::mpsc::channel(config.gossip.gateway_channel_len);
        spawn_peer_drainer(peer_rx, vec![rate_limit.clone(), bloom.clone()]);
        (Some(rate_limit), Some(bloom), Some(peer_tx))
    };

    let orchestrator = Arc::new(Orchestrator::new(
        self_id,
        config.clone(),
        signing_key,
        storage,
        rate_limiter,
        known_rounds,
        gossip_rate_limit,
        gossip_bloom,
        peer_tx,
        Arc::new(UnconfiguredMixServer),
        Arc::new(UnconfiguredNdf),
        None,
    ));
    let _ = orchestrator;

    info!("gateway startup complete, self id {self_id}");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    info!("shutting down");
    Ok(())
}

/// Placeholder collaborators wired up at startup. The wire transport, the
/// mix server RPC client and the NDF accessor are all explicitly out of
/// scope here (§1); a deployment links a real implementation of each in
/// place of these.
struct UnconfiguredTransport;

#[async_trait::async_trait]
impl nym_gateway::gossip::transport::GossipTransport for UnconfiguredTransport {
    async fn send(
        &self,
        _peer: &Id,
        _envelope: &nym_gateway::gossip::Envelope,
    ) -> GatewayResult<()> {
        Err(nym_gateway::GatewayError::NotConnected)
    }
}

struct UnconfiguredMixServer;

#[async_trait::async_trait]
impl nym_gateway::orchestrator::types::MixServerClient for UnconfiguredMixServer {
    async fn request_client_key(
        &self,
        _req: nym_gateway::orchestrator::types::ClientKeyRequest,
    ) -> GatewayResult<nym_gateway::orchestrator::types::ClientKeyResponse> {
        Err(nym_gateway::GatewayError::NotConnected)
    }

    async fn upload_batch(
        &self,
        _round_id: nym_gateway::model::RoundId,
        _slots: Vec<nym_gateway::buffer::UnmixedSlot>,
    ) -> GatewayResult<()> {
        Err(nym_gateway::GatewayError::NotConnected)
    }
}

struct UnconfiguredNdf;

impl nym_gateway::orchestrator::types::Ndf for UnconfiguredNdf {
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

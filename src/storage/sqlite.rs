// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Durable storage backend, backed by SQLite via `sqlx`. Schema is created
//! at startup; every multi-row write that must be atomic runs inside a
//! single transaction.

use super::{filter_intersects, GatewayStorage};
use crate::error::{GatewayError, GatewayResult};
use crate::identity::{EphemeralId, Id};
use crate::model::{Client, ClientBloomFilter, ClientRound, MixedMessage, Round, RoundId, RoundState};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str) -> GatewayResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        let storage = SqliteStorage { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> GatewayResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS clients (
                id BLOB PRIMARY KEY,
                key BLOB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rounds (
                id INTEGER PRIMARY KEY,
                update_id INTEGER NOT NULL,
                topology BLOB NOT NULL,
                batch_size INTEGER NOT NULL,
                state TEXT NOT NULL,
                timestamps BLOB NOT NULL,
                address_space_size INTEGER NOT NULL,
                signed_blob BLOB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mixed_messages (
                round_id INTEGER NOT NULL,
                recipient_id INTEGER NOT NULL,
                msg_id INTEGER NOT NULL,
                payload_a BLOB NOT NULL,
                payload_b BLOB NOT NULL,
                PRIMARY KEY (round_id, recipient_id, msg_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS client_bloom_filters (
                recipient_id INTEGER NOT NULL,
                epoch INTEGER NOT NULL,
                first_round INTEGER NOT NULL,
                round_range INTEGER NOT NULL,
                filter BLOB NOT NULL,
                PRIMARY KEY (recipient_id, epoch)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS epochs (
                round_id INTEGER PRIMARY KEY,
                epoch INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn state_to_str(state: RoundState) -> &'static str {
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

    fn str_to_state(s: &str) -> GatewayResult<RoundState> {
        Ok(match s {
            "PENDING" => RoundState::Pending,
            "PRECOMPUTING" => RoundState::Precomputing,
            "STANDBY" => RoundState::Standby,
            "QUEUED" => RoundState::Queued,
            "REALTIME" => RoundState::Realtime,
            "COMPLETED" => RoundState::Completed,
            "FAILED" => RoundState::Failed,
            other => return Err(GatewayError::Backend(format!("unknown round state {other}"))),
        })
    }

    fn row_to_round(row: &sqlx::sqlite::SqliteRow) -> GatewayResult<Round> {
        let topology_bytes: Vec<u8> = row.try_get("topology")?;
        let timestamps_bytes: Vec<u8> = row.try_get("timestamps")?;
        let topology: Vec<Id> = bincode::deserialize(&topology_bytes)?;
        let timestamps: HashMap<String, i64> = bincode::deserialize(&timestamps_bytes)?;
        let state_str: String = row.try_get("state")?;
        Ok(Round {
            id: row.try_get::<i64, _>("id")? as u64,
            update_id: row.try_get::<i64, _>("update_id")? as u64,
            topology,
            batch_size: row.try_get::<i64, _>("batch_size")? as u32,
            state: Self::str_to_state(&state_str)?,
            timestamps,
            address_space_size: row.try_get::<i64, _>("address_space_size")? as u32,
            signed_blob: row.try_get("signed_blob")?,
        })
    }
}

#[async_trait]
impl GatewayStorage for SqliteStorage {
    async fn insert_client(&self, client: &Client) -> GatewayResult<()> {
        let existing = self.get_client(&client.id).await;
        if existing.is_ok() {
            return Err(GatewayError::AlreadyExists);
        }
        sqlx::query("INSERT INTO clients (id, key) VALUES (?, ?)")
            .bind(client.id.to_bytes().to_vec())
            .bind(&client.key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_client(&self, client: &Client) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO clients (id, key) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET key = excluded.key",
        )
        .bind(client.id.to_bytes().to_vec())
        .bind(&client.key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_client(&self, id: &Id) -> GatewayResult<Client> {
        let row = sqlx::query("SELECT id, key FROM clients WHERE id = ?")
            .bind(id.to_bytes().to_vec())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(GatewayError::NotFound)?;
        let id_bytes: Vec<u8> = row.try_get("id")?;
        Ok(Client {
            id: Id::from_bytes(&id_bytes)?,
            key: row.try_get("key")?,
        })
    }

    async fn upsert_round(&self, round: &Round) -> GatewayResult<()> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("SELECT update_id FROM rounds WHERE id = ?")
            .bind(round.id as i64)
            .fetch_optional(&mut tx)
            .await?;

        if let Some(row) = existing {
            let stored_update_id: i64 = row.try_get("update_id")?;
            if stored_update_id as u64 >= round.update_id {
                return Ok(());
            }
        }

        let topology_bytes = bincode::serialize(&round.topology)?;
        let timestamps_bytes = bincode::serialize(&round.timestamps)?;

        sqlx::query(
            "INSERT INTO rounds (id, update_id, topology, batch_size, state, timestamps, address_space_size, signed_blob)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                update_id = excluded.update_id,
                topology = excluded.topology,
                batch_size = excluded.batch_size,
                state = excluded.state,
                timestamps = excluded.timestamps,
                address_space_size = excluded.address_space_size,
                signed_blob = excluded.signed_blob",
        )
        .bind(round.id as i64)
        .bind(round.update_id as i64)
        .bind(topology_bytes)
        .bind(round.batch_size as i64)
        .bind(Self::state_to_str(round.state))
        .bind(timestamps_bytes)
        .bind(round.address_space_size as i64)
        .bind(&round.signed_blob)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_round(&self, id: RoundId) -> GatewayResult<Round> {
        let row = sqlx::query("SELECT * FROM rounds WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(GatewayError::NotFound)?;
        Self::row_to_round(&row)
    }

    async fn get_rounds(&self, ids: &[RoundId]) -> GatewayResult<Vec<Round>> {
        let mut out = Vec::new();
        for id in ids {
            if let Ok(round) = self.get_round(*id).await {
                out.push(round);
            }
        }
        if out.is_empty() {
            return Err(GatewayError::NotFound);
        }
        Ok(out)
    }

    async fn insert_mixed_messages(&self, client_round: &ClientRound) -> GatewayResult<()> {
        let mut tx = self.pool.begin().await?;
        for msg in &client_round.messages {
            let exists = sqlx::query(
                "SELECT 1 FROM mixed_messages WHERE round_id = ? AND recipient_id = ? AND msg_id = ?",
            )
            .bind(msg.round_id as i64)
            .bind(msg.recipient_id.int64())
            .bind(msg.id as i64)
            .fetch_optional(&mut tx)
            .await?;
            if exists.is_some() {
                return Err(GatewayError::AlreadyExists);
            }
        }
        for msg in &client_round.messages {
            sqlx::query(
                "INSERT INTO mixed_messages (round_id, recipient_id, msg_id, payload_a, payload_b)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(msg.round_id as i64)
            .bind(msg.recipient_id.int64())
            .bind(msg.id as i64)
            .bind(&msg.payload_a)
            .bind(&msg.payload_b)
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_mixed_messages(
        &self,
        recipient: EphemeralId,
        round: RoundId,
    ) -> GatewayResult<(Vec<MixedMessage>, bool)> {
        let count_row = sqlx::query("SELECT COUNT(*) as c FROM mixed_messages WHERE round_id = ?")
            .bind(round as i64)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = count_row.try_get("c")?;
        let has_round = count > 0;

        let rows = sqlx::query(
            "SELECT msg_id, payload_a, payload_b FROM mixed_messages
             WHERE round_id = ? AND recipient_id = ?",
        )
        .bind(round as i64)
        .bind(recipient.int64())
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .into_iter()
            .map(|row| {
                Ok(MixedMessage {
                    id: row.try_get::<i64, _>("msg_id")? as u64,
                    round_id: round,
                    recipient_id: recipient,
                    payload_a: row.try_get("payload_a")?,
                    payload_b: row.try_get("payload_b")?,
                })
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok((messages, has_round))
    }

    async fn delete_mixed_messages_by_round(&self, round: RoundId) -> GatewayResult<()> {
        sqlx::query("DELETE FROM mixed_messages WHERE round_id = ?")
            .bind(round as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_client_bloom_filter(&self, filter: &ClientBloomFilter) -> GatewayResult<()> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT first_round, round_range, filter FROM client_bloom_filters
             WHERE recipient_id = ? AND epoch = ?",
        )
        .bind(filter.recipient_id)
        .bind(filter.epoch)
        .fetch_optional(&mut tx)
        .await?;

        let merged = match existing {
            Some(row) => {
                let mut stored = ClientBloomFilter {
                    recipient_id: filter.recipient_id,
                    epoch: filter.epoch,
                    first_round: row.try_get::<i64, _>("first_round")? as RoundId,
                    round_range: row.try_get::<i64, _>("round_range")? as u32,
                    filter: row.try_get("filter")?,
                };
                stored.merge(filter);
                stored
            }
            None => filter.clone(),
        };

        sqlx::query(
            "INSERT INTO client_bloom_filters (recipient_id, epoch, first_round, round_range, filter)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(recipient_id, epoch) DO UPDATE SET
                first_round = excluded.first_round,
                round_range = excluded.round_range,
                filter = excluded.filter",
        )
        .bind(merged.recipient_id)
        .bind(merged.epoch)
        .bind(merged.first_round as i64)
        .bind(merged.round_range as i64)
        .bind(&merged.filter)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_client_bloom_filters(
        &self,
        recipient: i64,
        first_round: RoundId,
        last_round: RoundId,
    ) -> GatewayResult<Vec<ClientBloomFilter>> {
        let rows = sqlx::query(
            "SELECT epoch, first_round, round_range, filter FROM client_bloom_filters
             WHERE recipient_id = ?",
        )
        .bind(recipient)
        .fetch_all(&self.pool)
        .await?;

        let filters = rows
            .into_iter()
            .map(|row| {
                Ok(ClientBloomFilter {
                    recipient_id: recipient,
                    epoch: row.try_get::<i64, _>("epoch")? as u32,
                    first_round: row.try_get::<i64, _>("first_round")? as RoundId,
                    round_range: row.try_get::<i64, _>("round_range")? as u32,
                    filter: row.try_get("filter")?,
                })
            })
            .collect::<GatewayResult<Vec<_>>>()?
            .into_iter()
            .filter(|f| filter_intersects(f, first_round, last_round))
            .collect();

        Ok(filters)
    }

    async fn delete_client_filters_before_epoch(&self, epoch: u32) -> GatewayResult<()> {
        sqlx::query("DELETE FROM client_bloom_filters WHERE epoch < ?")
            .bind(epoch)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_epoch(&self, round: RoundId, epoch: u32) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO epochs (round_id, epoch) VALUES (?, ?)
             ON CONFLICT(round_id) DO UPDATE SET epoch = excluded.epoch",
        )
        .bind(round as i64)
        .bind(epoch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Deterministic junk (dummy) slot generation, used to pad a round's batch
//! up to `BatchSize` before it is shipped to the mix server.

use crate::buffer::UnmixedSlot;
use crate::identity::crypto::cmix_hash_concat;
use crate::identity::Id;
use crate::model::RoundId;

/// Canonical length of the dummy `IdentityFP`; all-zero bytes of this
/// length mark a slot as junk.
pub const IDENTITY_FP_LEN: usize = 32;
pub const JUNK_PAYLOAD_LEN: usize = 128;
pub const JUNK_SALT_LEN: usize = 32;

pub fn dummy_identity_fp() -> Vec<u8> {
    vec![0u8; IDENTITY_FP_LEN]
}

pub fn is_dummy_identity_fp(fp: &[u8]) -> bool {
    fp.len() == IDENTITY_FP_LEN && fp.iter().all(|b| *b == 0)
}

/// Generates the `msg_num`-th junk slot for `round_id`. Deterministic in
/// `(msg_num, round_id)`: the payload encodes `msg_num + 1` at offset 1, the
/// salt is `0x01` followed by zeros, and the ephemeral id and MAC are both
/// derived (via the dummy user and the round id) so the whole slot -- not
/// just the payload bytes -- reproduces identically for the same inputs.
pub fn generate_junk_slot(msg_num: u32, round_id: RoundId) -> UnmixedSlot {
    let dummy_user = Id::dummy_user();

    let mut payload_a = vec![0u8; JUNK_PAYLOAD_LEN];
    payload_a[1] = (msg_num + 1) as u8;
    let payload_b = vec![0u8; JUNK_PAYLOAD_LEN];

    let mut salt = vec![0u8; JUNK_SALT_LEN];
    salt[0] = 0x01;

    let mac = cmix_hash_concat(&[
        &dummy_user.to_bytes(),
        &payload_a,
        &salt,
        &round_id.to_be_bytes(),
        &msg_num.to_be_bytes(),
    ])
    .to_vec();

    UnmixedSlot {
        sender_id: dummy_user,
        payload_a,
        payload_b,
        salt,
        kmacs: vec![],
        mac,
    }
}

// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Fixed-width identifiers for nodes, gateways, users and dummy (junk)
//! senders, plus the ephemeral recipient identifier derived from a user id
//! and a time window.

pub mod crypto;

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const ID_LEN: usize = 33;
const PAYLOAD_LEN: usize = ID_LEN - 1;

/// Tag byte distinguishing what an [`Id`]'s bytes refer to. Two `Id`s with
/// the same payload but different kind are unrelated values to everything
/// except `set_kind`, which is the one place that relationship is made
/// explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Kind {
    Node = 0x00,
    Gateway = 0x01,
    User = 0x02,
    Dummy = 0x03,
}

impl Kind {
    fn from_byte(b: u8) -> GatewayResult<Self> {
        match b {
            0x00 => Ok(Kind::Node),
            0x01 => Ok(Kind::Gateway),
            0x02 => Ok(Kind::User),
            0x03 => Ok(Kind::Dummy),
            other => Err(GatewayError::Invalid(format!(
                "unrecognised identity kind tag {other:#x}"
            ))),
        }
    }
}

/// A fixed-width opaque identifier: a [`Kind`] tag followed by 32 bytes of
/// payload. Equality is byte-equality including the tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    kind: Kind,
    payload: [u8; PAYLOAD_LEN],
}

impl Id {
    pub fn new(kind: Kind, payload: [u8; PAYLOAD_LEN]) -> Self {
        Id { kind, payload }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn payload(&self) -> &[u8; PAYLOAD_LEN] {
        &self.payload
    }

    /// Returns a new identifier over the same payload bytes tagged with a
    /// different kind. Used to turn a gateway-kind id into the node-kind id
    /// that round topologies are expressed in terms of.
    pub fn set_kind(&self, kind: Kind) -> Self {
        Id {
            kind,
            payload: self.payload,
        }
    }

    pub fn to_bytes(&self) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        out[0] = self.kind as u8;
        out[1..].copy_from_slice(&self.payload);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> GatewayResult<Self> {
        if bytes.len() != ID_LEN {
            return Err(GatewayError::Invalid(format!(
                "identifier must be {ID_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let kind = Kind::from_byte(bytes[0])?;
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&bytes[1..]);
        Ok(Id { kind, payload })
    }

    pub fn dummy_user() -> Self {
        Id::new(Kind::Dummy, [0u8; PAYLOAD_LEN])
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({:?}, {})", self.kind, hex::encode(self.payload))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// Ephemeral recipient identifier: a 63-bit-derived `i64` that identifies a
/// user only for the lifetime of a single address-space window. A cleared
/// value of zero is the dummy sentinel and must never be stored or
/// gossiped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EphemeralId(pub i64);

impl EphemeralId {
    /// Derives an ephemeral id from a user id and a coarse time window,
    /// using the cMix hash over their concatenation.
    pub fn derive(user: &Id, time_window_ns: i64) -> Self {
        let mut buf = Vec::with_capacity(ID_LEN + 8);
        buf.extend_from_slice(&user.to_bytes());
        buf.extend_from_slice(&time_window_ns.to_be_bytes());
        let digest = crypto::cmix_hash(&buf);
        // top bit cleared so the value is always non-negative before masking
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let v = i64::from_be_bytes(raw) & i64::MAX;
        EphemeralId(v)
    }

    /// Masks the low `address_space_size` bits to zero. A result of zero
    /// denotes the dummy recipient and must be treated as "no recipient".
    pub fn clear(&self, address_space_size: u32) -> Self {
        if address_space_size == 0 {
            return *self;
        }
        let mask = !((1i64 << address_space_size) - 1);
        EphemeralId(self.0 & mask)
    }

    pub fn is_dummy(&self) -> bool {
        self.0 == 0
    }

    pub fn int64(&self) -> i64 {
        self.0
    }
}

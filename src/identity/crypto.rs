// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! cMix hash and RSA sign/verify primitives. These are the only two
//! cryptographic building blocks the gateway itself performs; the mixnet's
//! own cryptography (Sphinx-style packet processing) is out of scope.

use crate::error::{GatewayError, GatewayResult};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// The cMix hash used throughout the gateway for MAC construction and
/// ephemeral id derivation. Concretized as SHA-256 over the concatenated
/// input, matching the hashing discipline already used by the handshake
/// module this crate is grounded on.
pub fn cmix_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn cmix_hash_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    pub fn generate<R: rand::RngCore + rand::CryptoRng>(
        rng: &mut R,
        bits: usize,
    ) -> GatewayResult<Self> {
        let private = RsaPrivateKey::new(rng, bits)?;
        let public = RsaPublicKey::from(&private);
        Ok(KeyPair { private, public })
    }

    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        KeyPair { private, public }
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// cMix hash of the public modulus, used as this gateway's node-kind
    /// identity payload.
    pub fn public_key_fingerprint(&self) -> [u8; 32] {
        cmix_hash(&self.public.n().to_bytes_be())
    }

    /// Signs `SHA256(data)` with PKCS#1 v1.5, matching the gossip envelope
    /// invariant `Signature = RSA-sign(priv, SHA256(Tag‖Origin‖Payload))`.
    pub fn sign<R: rand::RngCore + rand::CryptoRng>(&self, rng: &mut R, data: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::<Sha256>::new(self.private.clone());
        let signature = signing_key.sign_with_rng(rng, data);
        signature.to_bytes().to_vec()
    }
}

pub fn verify(public: &RsaPublicKey, data: &[u8], signature_bytes: &[u8]) -> GatewayResult<()> {
    let verifying_key = VerifyingKey::<Sha256>::new(public.clone());
    let signature = Signature::try_from(signature_bytes)
        .map_err(|_| GatewayError::Unauthenticated)?;
    verifying_key
        .verify(data, &signature)
        .map_err(|_| GatewayError::Unauthenticated)
}

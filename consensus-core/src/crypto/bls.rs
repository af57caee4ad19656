// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! BLS12-381 signatures with same-message aggregation.
//!
//! Signatures are 48-byte compressed G1 points, public keys 96-byte
//! compressed G2 points. Aggregation sums signatures over a common
//! message so a quorum certificate stays a single signature regardless
//! of how many nodes signed.

use bls12_381_plus::{
    multi_miller_loop, G1Affine, G1Projective, G2Affine, G2Prepared, G2Projective, Gt, Scalar,
};
use ff::Field;
use group::{Curve, Group};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Neg;

/// Domain separation tags. A signature is only valid in the context it
/// was produced for.
pub mod dst {
    /// Request contents and signature-chain links.
    pub const MESSAGE: &[u8] = b"TBB_SIM_BLS_MESSAGE_V1";
    /// Votes and the quorum certificates aggregated from them.
    pub const VOTE: &[u8] = b"TBB_SIM_BLS_VOTE_V1";
}

/// Errors from key handling and aggregation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Secret key is zero")]
    ZeroSecretKey,

    #[error("Invalid or malformed public key")]
    InvalidPublicKey,

    #[error("Invalid or malformed signature")]
    InvalidSignature,

    #[error("Key generation failed")]
    KeyGenerationFailed,

    #[error("Signer set is empty")]
    EmptySignerSet,
}

/// Map a message into G1, domain-separated by `dst`.
fn hash_to_g1(message: &[u8], dst: &[u8]) -> G1Projective {
    let mut hasher = Sha256::new();
    hasher.update(dst);
    hasher.update((message.len() as u64).to_le_bytes());
    hasher.update(message);
    let first = hasher.finalize();

    let mut hasher = Sha256::new();
    hasher.update(first);
    hasher.update(b"_widen");
    let second = hasher.finalize();

    let mut wide = [0u8; 64];
    wide[..32].copy_from_slice(&first);
    wide[32..].copy_from_slice(&second);

    G1Projective::generator() * Scalar::from_bytes_wide(&wide)
}

/// BLS secret key (scalar).
#[derive(Clone)]
pub struct SecretKey {
    scalar: Scalar,
}

impl SecretKey {
    /// Generate a key from OS entropy.
    pub fn random() -> Result<Self, CryptoError> {
        let mut wide = [0u8; 64];
        getrandom::getrandom(&mut wide).map_err(|_| CryptoError::KeyGenerationFailed)?;
        let scalar = Scalar::from_bytes_wide(&wide);
        if bool::from(scalar.is_zero()) {
            return Err(CryptoError::ZeroSecretKey);
        }
        Ok(SecretKey { scalar })
    }

    /// Derive a key from 64 uniform bytes (reduced mod the group order).
    pub fn from_wide_bytes(wide: &[u8; 64]) -> Result<Self, CryptoError> {
        let scalar = Scalar::from_bytes_wide(wide);
        if bool::from(scalar.is_zero()) {
            return Err(CryptoError::ZeroSecretKey);
        }
        Ok(SecretKey { scalar })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            point: (G2Projective::generator() * self.scalar).to_affine(),
        }
    }

    /// Sign `message` under the given domain separation tag.
    pub fn sign(&self, message: &[u8], dst: &[u8]) -> Signature {
        Signature {
            point: (hash_to_g1(message, dst) * self.scalar).to_affine(),
        }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// BLS public key (compressed G2, 96 bytes).
#[derive(Clone, Copy)]
pub struct PublicKey {
    point: G2Affine,
}

impl PublicKey {
    pub const BYTES: usize = 96;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != Self::BYTES {
            return Err(CryptoError::InvalidPublicKey);
        }
        let mut arr = [0u8; 96];
        arr.copy_from_slice(bytes);
        let point = G2Affine::from_compressed(&arr);
        if bool::from(point.is_none()) {
            return Err(CryptoError::InvalidPublicKey);
        }
        let point = point.unwrap();
        if bool::from(point.is_identity()) {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(PublicKey { point })
    }

    pub fn to_bytes(&self) -> [u8; 96] {
        self.point.to_compressed()
    }

    /// Pairing check: e(sig, -g2) * e(H(m), pk) == 1.
    pub fn verify(&self, message: &[u8], signature: &Signature, dst: &[u8]) -> bool {
        let h = hash_to_g1(message, dst).to_affine();
        let g2_neg = G2Prepared::from(G2Affine::generator().neg());
        let pk = G2Prepared::from(self.point);

        let result = multi_miller_loop(&[(&signature.point, &g2_neg), (&h, &pk)])
            .final_exponentiation();
        result == Gt::identity()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.point == other.point
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", hex::encode(&self.to_bytes()[..4]))
    }
}

/// BLS signature (compressed G1, 48 bytes).
#[derive(Clone, Copy)]
pub struct Signature {
    point: G1Affine,
}

impl Signature {
    pub const BYTES: usize = 48;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != Self::BYTES {
            return Err(CryptoError::InvalidSignature);
        }
        let mut arr = [0u8; 48];
        arr.copy_from_slice(bytes);
        let point = G1Affine::from_compressed(&arr);
        if bool::from(point.is_none()) {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(Signature {
            point: point.unwrap(),
        })
    }

    pub fn to_bytes(&self) -> [u8; 48] {
        self.point.to_compressed()
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.point == other.point
    }
}

impl Eq for Signature {}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.to_bytes()[..4]))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SignatureVisitor;

        impl<'de> serde::de::Visitor<'de> for SignatureVisitor {
            type Value = Signature;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("48 bytes")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Signature, E>
            where
                E: serde::de::Error,
            {
                Signature::from_bytes(v).map_err(|e| E::custom(e.to_string()))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Signature, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut bytes = Vec::with_capacity(Signature::BYTES);
                while let Some(byte) = seq.next_element()? {
                    bytes.push(byte);
                }
                Signature::from_bytes(&bytes).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_bytes(SignatureVisitor)
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PublicKeyVisitor;

        impl<'de> serde::de::Visitor<'de> for PublicKeyVisitor {
            type Value = PublicKey;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("96 bytes")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<PublicKey, E>
            where
                E: serde::de::Error,
            {
                PublicKey::from_bytes(v).map_err(|e| E::custom(e.to_string()))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<PublicKey, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut bytes = Vec::with_capacity(PublicKey::BYTES);
                while let Some(byte) = seq.next_element()? {
                    bytes.push(byte);
                }
                PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_bytes(PublicKeyVisitor)
    }
}

/// Sum signatures over a common message into one.
pub fn aggregate_signatures(signatures: &[Signature]) -> Result<Signature, CryptoError> {
    if signatures.is_empty() {
        return Err(CryptoError::EmptySignerSet);
    }
    let mut sum = G1Projective::from(signatures[0].point);
    for sig in &signatures[1..] {
        sum += G1Projective::from(sig.point);
    }
    Ok(Signature {
        point: sum.to_affine(),
    })
}

/// Verify an aggregated signature where every signer signed `message`.
pub fn verify_aggregate(
    pubkeys: &[PublicKey],
    message: &[u8],
    dst: &[u8],
    signature: &Signature,
) -> bool {
    if pubkeys.is_empty() {
        return false;
    }
    let mut sum = G2Projective::from(pubkeys[0].point);
    for pk in &pubkeys[1..] {
        sum += G2Projective::from(pk.point);
    }
    let aggregated = PublicKey {
        point: sum.to_affine(),
    };
    aggregated.verify(message, signature, dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let sk = SecretKey::random().unwrap();
        let pk = sk.public_key();
        let sig = sk.sign(b"hello", dst::MESSAGE);

        assert!(pk.verify(b"hello", &sig, dst::MESSAGE));
        assert!(!pk.verify(b"tampered", &sig, dst::MESSAGE));
    }

    #[test]
    fn test_domain_separation() {
        let sk = SecretKey::random().unwrap();
        let pk = sk.public_key();
        let sig = sk.sign(b"same data", dst::VOTE);

        assert!(pk.verify(b"same data", &sig, dst::VOTE));
        assert!(!pk.verify(b"same data", &sig, dst::MESSAGE));
    }

    #[test]
    fn test_aggregate_same_message() {
        let keys: Vec<SecretKey> = (0..3).map(|_| SecretKey::random().unwrap()).collect();
        let message = b"vote payload";
        let sigs: Vec<Signature> = keys.iter().map(|k| k.sign(message, dst::VOTE)).collect();
        let pubkeys: Vec<PublicKey> = keys.iter().map(|k| k.public_key()).collect();

        let agg = aggregate_signatures(&sigs).unwrap();
        assert!(verify_aggregate(&pubkeys, message, dst::VOTE, &agg));
        assert!(!verify_aggregate(&pubkeys, b"other", dst::VOTE, &agg));

        // Missing one signer's key must fail the pairing check.
        assert!(!verify_aggregate(&pubkeys[..2], message, dst::VOTE, &agg));
    }

    #[test]
    fn test_aggregate_empty_set_rejected() {
        assert_eq!(
            aggregate_signatures(&[]),
            Err(CryptoError::EmptySignerSet)
        );
    }

    #[test]
    fn test_signature_roundtrip_bytes() {
        let sk = SecretKey::random().unwrap();
        let sig = sk.sign(b"x", dst::MESSAGE);
        let restored = Signature::from_bytes(&sig.to_bytes()).unwrap();
        assert_eq!(sig, restored);

        let pk = sk.public_key();
        let restored = PublicKey::from_bytes(&pk.to_bytes()).unwrap();
        assert_eq!(pk, restored);
    }

    #[test]
    fn test_serde_roundtrip() {
        let sk = SecretKey::random().unwrap();
        let sig = sk.sign(b"x", dst::MESSAGE);
        let bytes = bincode::serialize(&sig).unwrap();
        let restored: Signature = bincode::deserialize(&bytes).unwrap();
        assert_eq!(sig, restored);
    }
}

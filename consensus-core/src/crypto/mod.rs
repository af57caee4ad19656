// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic primitives: BLS12-381 signatures and the node key store.

mod bls;
mod keystore;

pub use bls::{
    aggregate_signatures, dst, verify_aggregate, CryptoError, PublicKey, SecretKey, Signature,
};
pub use keystore::{derive_secret_key, KeyStore};

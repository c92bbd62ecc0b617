//! Envelope encryption for cloud object storage.
//!
//! "csek" encrypts each object with its own random data encryption key
//! (DEK), supplied to the store as a customer key, and keeps only the
//! KMS-wrapped DEK in object metadata. "cmek" leaves encryption to the
//! store under a KMS key and re-encrypts in place after key rotation.

pub mod aws;
pub mod cmek;
pub mod csek;
pub mod envelope;
pub mod errors;
pub mod kms;
pub mod memory;
pub mod random;
pub mod storage;

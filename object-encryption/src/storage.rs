use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{envelope::DataKey, errors::Result};

/// Metadata key holding the base64-encoded wrapped DEK.
pub const METADATA_WRAPPED_DEK: &str = "wDEK";
/// Metadata key holding the key version that wrapped the DEK.
pub const METADATA_CRYPT_KEY: &str = "cryptKey";

/// Custom object metadata.
pub type Metadata = BTreeMap<String, String>;

/// How the store should encrypt an object at rest.
#[derive(Debug, Clone, Copy)]
pub enum Encryption<'a> {
    /// Whatever the bucket applies by default (e.g., a bucket default KMS key).
    BucketDefault,
    /// Caller-supplied AES-256 key; the store keeps only its digest.
    CustomerSupplied(&'a DataKey),
    /// Named KMS key.
    Kms(&'a str),
}

/// Object attributes reported by the store on read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectAttrs {
    pub size: u64,
    /// KMS key (version) protecting the object, if any.
    pub kms_key_name: Option<String>,
    /// Store-specific digest of the customer-supplied key, if any.
    pub customer_key_digest: Option<String>,
    /// Store-specific object generation or version id.
    pub version: Option<String>,
}

/// Server-side copy request.
#[derive(Debug, Clone, Copy)]
pub struct CopyRequest<'a> {
    pub src_bucket: &'a str,
    pub dst_bucket: &'a str,
    pub object: &'a str,
    /// Key needed to read a source written with a customer-supplied key.
    pub source_key: Option<&'a DataKey>,
    pub encryption: Encryption<'a>,
    /// Replaces the destination metadata. "None" keeps the source metadata.
    pub metadata: Option<&'a Metadata>,
}

/// Object store collaborator.
/// Implementations are long-lived handles shared across requests.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes the payload with its metadata in a single request,
    /// returning the number of bytes written.
    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        payload: &[u8],
        encryption: Encryption<'_>,
        metadata: &Metadata,
    ) -> Result<usize>;

    /// Reads the custom metadata without any key material.
    async fn get_metadata(&self, bucket: &str, object: &str) -> Result<Metadata>;

    /// Reads the full payload. "key" must be given for objects written
    /// with a customer-supplied key.
    async fn get_object(
        &self,
        bucket: &str,
        object: &str,
        key: Option<&DataKey>,
    ) -> Result<(Vec<u8>, ObjectAttrs)>;

    /// Copies within the store. Copying an object onto itself must be atomic:
    /// readers see either the old or the new object.
    async fn copy_object(&self, req: CopyRequest<'_>) -> Result<()>;
}

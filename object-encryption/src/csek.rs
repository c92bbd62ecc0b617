use std::sync::Arc;

use log::{info, warn};

use crate::{
    envelope::{self, DataKey},
    errors::{Error::MissingKeyMetadata, Result},
    kms::KeyManagementService,
    storage::{
        CopyRequest, Encryption, Metadata, ObjectStore, METADATA_CRYPT_KEY, METADATA_WRAPPED_DEK,
    },
};

/// Customer-supplied encryption key (CSEK) service.
/// Each object is encrypted by the store with its own DEK; only the
/// KMS-wrapped DEK is persisted, in the object metadata.
#[derive(Clone)]
pub struct Service {
    store: Arc<dyn ObjectStore>,
    envelope: envelope::Manager,
}

impl Service {
    pub fn new(store: Arc<dyn ObjectStore>, kms: Arc<dyn KeyManagementService>) -> Self {
        Self {
            store,
            envelope: envelope::Manager::new(kms),
        }
    }

    /// Uploads the payload under a freshly generated DEK wrapped by "key_name".
    pub async fn upload(
        &self,
        key_name: &str,
        bucket: &str,
        object: &str,
        payload: &[u8],
    ) -> Result<usize> {
        let dek = envelope::generate_key()?;
        self.upload_with_key(key_name, bucket, object, &dek, payload)
            .await
    }

    /// Uploads the payload using a caller-generated DEK.
    /// The wrapped DEK and its key version are written with the payload.
    pub async fn upload_with_key(
        &self,
        key_name: &str,
        bucket: &str,
        object: &str,
        dek: &DataKey,
        payload: &[u8],
    ) -> Result<usize> {
        info!(
            "CSEK uploading '{}/{}' ({} bytes) with '{}'",
            bucket,
            object,
            payload.len(),
            key_name
        );
        let wrapped = self.envelope.wrap(key_name, dek).await?;

        let mut metadata = Metadata::new();
        metadata.insert(METADATA_WRAPPED_DEK.to_string(), wrapped.ciphertext);
        metadata.insert(METADATA_CRYPT_KEY.to_string(), wrapped.key_version);

        let size = self
            .store
            .put_object(
                bucket,
                object,
                payload,
                Encryption::CustomerSupplied(dek),
                &metadata,
            )
            .await?;
        info!("CSEK uploaded '{}/{}' ({} bytes)", bucket, object, size);
        Ok(size)
    }

    /// Downloads the payload, unwrapping its DEK from the object metadata.
    pub async fn download(&self, key_name: &str, bucket: &str, object: &str) -> Result<Vec<u8>> {
        info!("CSEK downloading '{}/{}' with '{}'", bucket, object, key_name);
        let (dek, _, _) = self.unwrap_object_key(key_name, bucket, object).await?;

        let (data, attrs) = self.store.get_object(bucket, object, Some(&dek)).await?;
        info!(
            "CSEK downloaded '{}/{}' ({} bytes)",
            bucket, object, attrs.size
        );
        Ok(data)
    }

    /// Copies the object to "dst_bucket", re-supplying the same DEK on both
    /// sides and carrying the wrapped DEK over in the destination metadata.
    pub async fn copy(
        &self,
        key_name: &str,
        dst_bucket: &str,
        src_bucket: &str,
        object: &str,
    ) -> Result<()> {
        info!(
            "CSEK copying '{}/{}' to '{}' with '{}'",
            src_bucket, object, dst_bucket, key_name
        );
        let (dek, wrapped, src_metadata) = self
            .unwrap_object_key(key_name, src_bucket, object)
            .await?;

        // the wrapped DEK is unchanged, so is the key version that produced it
        let crypt_key = match src_metadata.get(METADATA_CRYPT_KEY) {
            Some(v) if !v.is_empty() => v.clone(),
            _ => {
                warn!(
                    "'{}/{}' has no '{}'; recording '{}'",
                    src_bucket, object, METADATA_CRYPT_KEY, key_name
                );
                key_name.to_string()
            }
        };
        let mut metadata = Metadata::new();
        metadata.insert(METADATA_WRAPPED_DEK.to_string(), wrapped);
        metadata.insert(METADATA_CRYPT_KEY.to_string(), crypt_key);

        self.store
            .copy_object(CopyRequest {
                src_bucket,
                dst_bucket,
                object,
                source_key: Some(&dek),
                encryption: Encryption::CustomerSupplied(&dek),
                metadata: Some(&metadata),
            })
            .await?;
        info!("CSEK copied '{}/{}' to '{}'", src_bucket, object, dst_bucket);
        Ok(())
    }

    /// Reads the object metadata and unwraps its DEK, returning the DEK,
    /// the wrapped form it was read from, and the full metadata.
    /// Fails before any keyed read if the wrapped DEK is missing.
    async fn unwrap_object_key(
        &self,
        key_name: &str,
        bucket: &str,
        object: &str,
    ) -> Result<(DataKey, String, Metadata)> {
        let metadata = self.store.get_metadata(bucket, object).await?;
        let wrapped = match metadata.get(METADATA_WRAPPED_DEK) {
            Some(v) if !v.is_empty() => v.clone(),
            _ => {
                return Err(MissingKeyMetadata {
                    bucket: bucket.to_string(),
                    object: object.to_string(),
                })
            }
        };

        let dek = self.envelope.unwrap(key_name, &wrapped).await?;
        Ok((dek, wrapped, metadata))
    }
}

#[cfg(test)]
const TEST_KEY_NAME: &str = "projects/p/locations/global/keyRings/r/cryptoKeys/k";

#[cfg(test)]
fn test_service() -> (Service, Arc<crate::memory::store::Store>) {
    let kms = Arc::new(crate::memory::kms::Manager::new());
    kms.create_key(TEST_KEY_NAME).unwrap();
    let store = Arc::new(crate::memory::store::Store::with_kms(kms.clone()));
    store.create_bucket("bucket-a");
    store.create_bucket("bucket-b");
    (Service::new(store.clone(), kms), store)
}

#[test]
fn test_upload_download() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let (service, store) = test_service();

    let size = ab!(service.upload(TEST_KEY_NAME, "bucket-a", "test-1", b"Hello World")).unwrap();
    assert_eq!(size, 11);

    let got = ab!(service.download(TEST_KEY_NAME, "bucket-a", "test-1")).unwrap();
    assert_eq!(got, b"Hello World");

    let metadata = ab!(store.get_metadata("bucket-a", "test-1")).unwrap();
    assert!(!metadata[METADATA_WRAPPED_DEK].is_empty());
    assert_eq!(
        metadata[METADATA_CRYPT_KEY],
        format!("{}/cryptoKeyVersions/1", TEST_KEY_NAME)
    );

    // stored encrypted under a customer-supplied key
    assert!(ab!(store.get_object("bucket-a", "test-1", None)).is_err());

    let ret = ab!(service.download(TEST_KEY_NAME, "bucket-a", "missing-1"));
    assert!(matches!(
        ret,
        Err(crate::errors::Error::StorageRead { .. })
    ));
}

#[test]
fn test_round_trip_payloads() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let (service, _) = test_service();
    let large = crate::random::bytes(1 << 20).unwrap();
    for (i, payload) in [Vec::new(), vec![0u8; 1], large].iter().enumerate() {
        let object = format!("object-{}", i);
        let size = ab!(service.upload(TEST_KEY_NAME, "bucket-a", &object, payload)).unwrap();
        assert_eq!(size, payload.len());
        let got = ab!(service.download(TEST_KEY_NAME, "bucket-a", &object)).unwrap();
        assert_eq!(&got, payload);
    }
}

#[test]
fn test_raw_key_never_stored() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let (service, store) = test_service();
    let dek = envelope::generate_key().unwrap();
    ab!(service.upload_with_key(TEST_KEY_NAME, "bucket-a", "o", &dek, b"secret")).unwrap();

    let encoded = dek.encode_base64();
    let raw = String::from_utf8_lossy(dek.as_bytes()).to_string();
    let metadata = ab!(store.get_metadata("bucket-a", "o")).unwrap();
    for v in metadata.values() {
        assert!(!v.contains(encoded.as_str()));
        assert!(!v.contains(&raw));
    }

    // the stored object only opens with the same DEK
    let (data, _) = ab!(store.get_object("bucket-a", "o", Some(&dek))).unwrap();
    assert_eq!(data, b"secret");
}

#[test]
fn test_missing_key_metadata() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let (service, store) = test_service();
    ab!(store.put_object(
        "bucket-a",
        "plain",
        b"data",
        Encryption::BucketDefault,
        &Metadata::new()
    ))
    .unwrap();

    let mut empty = Metadata::new();
    empty.insert(METADATA_WRAPPED_DEK.to_string(), String::new());
    ab!(store.put_object(
        "bucket-a",
        "empty",
        b"data",
        Encryption::BucketDefault,
        &empty
    ))
    .unwrap();

    for object in ["plain", "empty"] {
        let ret = ab!(service.download(TEST_KEY_NAME, "bucket-a", object));
        assert!(matches!(ret, Err(MissingKeyMetadata { .. })));

        let ret = ab!(service.copy(TEST_KEY_NAME, "bucket-b", "bucket-a", object));
        assert!(matches!(ret, Err(MissingKeyMetadata { .. })));
    }
    assert!(ab!(store.get_metadata("bucket-b", "plain")).is_err());
}

#[test]
fn test_copy() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let (service, store) = test_service();
    ab!(service.upload(TEST_KEY_NAME, "bucket-a", "o", b"Hello World")).unwrap();
    let before = ab!(service.download(TEST_KEY_NAME, "bucket-a", "o")).unwrap();

    ab!(service.copy(TEST_KEY_NAME, "bucket-b", "bucket-a", "o")).unwrap();
    let after = ab!(service.download(TEST_KEY_NAME, "bucket-b", "o")).unwrap();
    assert_eq!(before, after);

    let src = ab!(store.get_metadata("bucket-a", "o")).unwrap();
    let dst = ab!(store.get_metadata("bucket-b", "o")).unwrap();
    assert_eq!(src, dst);

    let ret = ab!(service.copy(TEST_KEY_NAME, "bucket-missing", "bucket-a", "o"));
    assert!(matches!(
        ret,
        Err(crate::errors::Error::StorageCopy { .. })
    ));
}

#[test]
fn test_copy_without_crypt_key_records_input_key() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let (service, store) = test_service();
    let dek = envelope::generate_key().unwrap();
    let wrapped = ab!(service.envelope.wrap(TEST_KEY_NAME, &dek)).unwrap();

    let mut metadata = Metadata::new();
    metadata.insert(METADATA_WRAPPED_DEK.to_string(), wrapped.ciphertext);
    ab!(store.put_object(
        "bucket-a",
        "legacy",
        b"data",
        Encryption::CustomerSupplied(&dek),
        &metadata
    ))
    .unwrap();

    ab!(service.copy(TEST_KEY_NAME, "bucket-b", "bucket-a", "legacy")).unwrap();
    let dst = ab!(store.get_metadata("bucket-b", "legacy")).unwrap();
    assert_eq!(dst[METADATA_CRYPT_KEY], TEST_KEY_NAME);
}

#[test]
fn test_rotated_master_key_still_unwraps() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let kms = Arc::new(crate::memory::kms::Manager::new());
    kms.create_key(TEST_KEY_NAME).unwrap();
    let store = Arc::new(crate::memory::store::Store::new());
    store.create_bucket("bucket-a");
    let service = Service::new(store.clone(), kms.clone());

    ab!(service.upload(TEST_KEY_NAME, "bucket-a", "o", b"before rotation")).unwrap();
    kms.rotate(TEST_KEY_NAME).unwrap();
    ab!(service.upload(TEST_KEY_NAME, "bucket-a", "p", b"after rotation")).unwrap();

    let o = ab!(store.get_metadata("bucket-a", "o")).unwrap();
    let p = ab!(store.get_metadata("bucket-a", "p")).unwrap();
    assert!(o[METADATA_CRYPT_KEY].ends_with("/cryptoKeyVersions/1"));
    assert!(p[METADATA_CRYPT_KEY].ends_with("/cryptoKeyVersions/2"));

    assert_eq!(
        ab!(service.download(TEST_KEY_NAME, "bucket-a", "o")).unwrap(),
        b"before rotation"
    );
    assert_eq!(
        ab!(service.download(TEST_KEY_NAME, "bucket-a", "p")).unwrap(),
        b"after rotation"
    );
}

#[test]
fn test_service_errors() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let kms = Arc::new(crate::memory::kms::Manager::new());
    kms.create_key(TEST_KEY_NAME).unwrap();
    let other = "projects/p/locations/global/keyRings/r/cryptoKeys/other";
    kms.create_key(other).unwrap();
    let store = Arc::new(crate::memory::store::Store::with_kms(kms.clone()));
    store.create_bucket("bucket-a");
    store.create_bucket("bucket-b");
    let service = Service::new(store.clone(), kms);

    ab!(service.upload(TEST_KEY_NAME, "bucket-a", "o", b"data")).unwrap();

    // wrapped under a different master key
    assert!(matches!(
        ab!(service.download(other, "bucket-a", "o")),
        Err(crate::errors::Error::KeyManagement { .. })
    ));
    assert!(matches!(
        ab!(service.copy(other, "bucket-b", "bucket-a", "o")),
        Err(crate::errors::Error::KeyManagement { .. })
    ));
    assert!(ab!(store.get_metadata("bucket-b", "o")).is_err());

    assert!(matches!(
        ab!(service.upload(TEST_KEY_NAME, "bucket-missing", "o", b"data")),
        Err(crate::errors::Error::StorageWrite { .. })
    ));
}

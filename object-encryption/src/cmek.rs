use std::sync::Arc;

use log::info;

use crate::{
    errors::Result,
    storage::{CopyRequest, Encryption, Metadata, ObjectAttrs, ObjectStore},
};

/// Customer-managed encryption key (CMEK) service.
/// The store encrypts with the bucket default KMS key, so no key material
/// passes through this service.
#[derive(Clone)]
pub struct Service {
    store: Arc<dyn ObjectStore>,
}

impl Service {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Uploads the payload; the bucket default key applies.
    pub async fn upload(&self, bucket: &str, object: &str, payload: &[u8]) -> Result<usize> {
        info!(
            "CMEK uploading '{}/{}' ({} bytes) with bucket default key",
            bucket,
            object,
            payload.len()
        );
        self.store
            .put_object(
                bucket,
                object,
                payload,
                Encryption::BucketDefault,
                &Metadata::new(),
            )
            .await
    }

    /// Uploads the payload encrypted under the named KMS key.
    pub async fn upload_with_key(
        &self,
        key_name: &str,
        bucket: &str,
        object: &str,
        payload: &[u8],
    ) -> Result<usize> {
        info!(
            "CMEK uploading '{}/{}' ({} bytes) with '{}'",
            bucket,
            object,
            payload.len(),
            key_name
        );
        self.store
            .put_object(
                bucket,
                object,
                payload,
                Encryption::Kms(key_name),
                &Metadata::new(),
            )
            .await
    }

    /// Downloads the payload with its attributes.
    pub async fn download(&self, bucket: &str, object: &str) -> Result<(Vec<u8>, ObjectAttrs)> {
        info!("CMEK downloading '{}/{}'", bucket, object);
        self.store.get_object(bucket, object, None).await
    }

    /// Re-encrypts after the bucket default key was rotated.
    /// Copies the object onto its own path; until the copy succeeds,
    /// readers keep getting the previous object.
    pub async fn re_encrypt(&self, bucket: &str, object: &str) -> Result<()> {
        info!("CMEK re-encrypting '{}/{}'", bucket, object);
        self.store
            .copy_object(CopyRequest {
                src_bucket: bucket,
                dst_bucket: bucket,
                object,
                source_key: None,
                encryption: Encryption::BucketDefault,
                metadata: None,
            })
            .await
    }
}

#[cfg(test)]
const TEST_KEY_NAME: &str = "projects/p/locations/global/keyRings/r/cryptoKeys/bucket-default";

#[test]
fn test_upload_download_re_encrypt() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let kms = Arc::new(crate::memory::kms::Manager::new());
    kms.create_key(TEST_KEY_NAME).unwrap();
    let store = Arc::new(crate::memory::store::Store::with_kms(kms.clone()));
    store.create_bucket_with_default_key("cmek", TEST_KEY_NAME);
    let service = Service::new(store);

    let size = ab!(service.upload("cmek", "test-1", b"Hello World")).unwrap();
    assert_eq!(size, 11);

    let (data, attrs) = ab!(service.download("cmek", "test-1")).unwrap();
    assert_eq!(data, b"Hello World");
    assert_eq!(attrs.size, 11);
    assert_eq!(
        attrs.kms_key_name,
        Some(format!("{}/cryptoKeyVersions/1", TEST_KEY_NAME))
    );

    let rotated = kms.rotate(TEST_KEY_NAME).unwrap();
    ab!(service.re_encrypt("cmek", "test-1")).unwrap();

    let (data, re_encrypted) = ab!(service.download("cmek", "test-1")).unwrap();
    assert_eq!(data, b"Hello World");
    assert_eq!(re_encrypted.kms_key_name, Some(rotated));
    assert_ne!(attrs.version, re_encrypted.version);

    assert!(matches!(
        ab!(service.re_encrypt("cmek", "missing-1")),
        Err(crate::errors::Error::StorageCopy { .. })
    ));
    assert!(matches!(
        ab!(service.download("cmek", "missing-1")),
        Err(crate::errors::Error::StorageRead { .. })
    ));
}

#[test]
fn test_upload_with_key() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let other = "projects/p/locations/global/keyRings/r/cryptoKeys/explicit";
    let kms = Arc::new(crate::memory::kms::Manager::new());
    kms.create_key(TEST_KEY_NAME).unwrap();
    kms.create_key(other).unwrap();
    let store = Arc::new(crate::memory::store::Store::with_kms(kms));
    store.create_bucket_with_default_key("cmek", TEST_KEY_NAME);
    let service = Service::new(store);

    let size = ab!(service.upload_with_key(other, "cmek", "o", b"data")).unwrap();
    assert_eq!(size, 4);
    let (_, attrs) = ab!(service.download("cmek", "o")).unwrap();
    assert_eq!(
        attrs.kms_key_name,
        Some(format!("{}/cryptoKeyVersions/1", other))
    );

    let missing = "projects/p/locations/global/keyRings/r/cryptoKeys/missing";
    assert!(matches!(
        ab!(service.upload_with_key(missing, "cmek", "o", b"data")),
        Err(crate::errors::Error::StorageWrite { .. })
    ));
}

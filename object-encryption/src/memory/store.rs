use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use log::{debug, info};
use parking_lot::RwLock;
use ring::digest::{digest, SHA256};

use crate::{
    envelope::DataKey,
    errors::{Error, Result},
    memory::kms,
    storage::{CopyRequest, Encryption, Metadata, ObjectAttrs, ObjectStore},
};

/// In-process object store emulator.
/// Mirrors the customer-supplied key rules of cloud stores: only the
/// SHA-256 digest of a supplied key is kept, and reads must present the
/// same key for such objects and no key for any other object.
#[derive(Default)]
pub struct Store {
    buckets: RwLock<HashMap<String, Bucket>>,
    kms: Option<Arc<kms::Manager>>,
}

#[derive(Default)]
struct Bucket {
    default_kms_key: Option<String>,
    objects: HashMap<String, StoredObject>,
    generation: u64,
}

#[derive(Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: Metadata,
    at_rest: AtRest,
    generation: u64,
}

#[derive(Clone, PartialEq, Eq)]
enum AtRest {
    ServiceManaged,
    CustomerSupplied { key_sha256: String },
    Kms { key_name: String },
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves KMS keys to their primary version at write time.
    pub fn with_kms(kms: Arc<kms::Manager>) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            kms: Some(kms),
        }
    }

    /// Creates a bucket; a no-op if it already exists.
    pub fn create_bucket(&self, bucket: &str) {
        info!("creating bucket '{}'", bucket);
        self.buckets.write().entry(bucket.to_string()).or_default();
    }

    /// Creates a bucket (or updates an existing one) with a default KMS key.
    pub fn create_bucket_with_default_key(&self, bucket: &str, key_name: &str) {
        info!("creating bucket '{}' with default key '{}'", bucket, key_name);
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .default_kms_key = Some(key_name.to_string());
    }

    fn at_rest(&self, bucket: &Bucket, encryption: Encryption<'_>) -> Result<AtRest> {
        let key_name = match encryption {
            Encryption::CustomerSupplied(key) => {
                return Ok(AtRest::CustomerSupplied {
                    key_sha256: key_digest(key),
                })
            }
            Encryption::Kms(key_name) => key_name.to_string(),
            Encryption::BucketDefault => match &bucket.default_kms_key {
                Some(k) => k.clone(),
                None => return Ok(AtRest::ServiceManaged),
            },
        };

        let key_name = match &self.kms {
            Some(kms) => kms.primary_version(&key_name)?,
            None => key_name,
        };
        Ok(AtRest::Kms { key_name })
    }
}

fn key_digest(key: &DataKey) -> String {
    STANDARD.encode(digest(&SHA256, key.as_bytes()).as_ref())
}

/// Checks the presented key against how the object is stored.
fn check_key(stored: &StoredObject, key: Option<&DataKey>) -> std::result::Result<(), String> {
    match (&stored.at_rest, key) {
        (AtRest::CustomerSupplied { key_sha256 }, Some(k)) => {
            if *key_sha256 != key_digest(k) {
                return Err(String::from(
                    "the supplied encryption key does not match the object key",
                ));
            }
            Ok(())
        }
        (AtRest::CustomerSupplied { .. }, None) => Err(String::from(
            "object is encrypted with a customer-supplied key but no key was given",
        )),
        (_, Some(_)) => Err(String::from(
            "object is not encrypted with a customer-supplied key",
        )),
        (_, None) => Ok(()),
    }
}

fn attrs(stored: &StoredObject) -> ObjectAttrs {
    let (kms_key_name, customer_key_digest) = match &stored.at_rest {
        AtRest::ServiceManaged => (None, None),
        AtRest::CustomerSupplied { key_sha256 } => (None, Some(key_sha256.clone())),
        AtRest::Kms { key_name } => (Some(key_name.clone()), None),
    };
    ObjectAttrs {
        size: stored.data.len() as u64,
        kms_key_name,
        customer_key_digest,
        version: Some(stored.generation.to_string()),
    }
}

#[async_trait]
impl ObjectStore for Store {
    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        payload: &[u8],
        encryption: Encryption<'_>,
        metadata: &Metadata,
    ) -> Result<usize> {
        let mut buckets = self.buckets.write();
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| Error::write(bucket, object, "bucket not found"))?;
        let at_rest = self
            .at_rest(b, encryption)
            .map_err(|e| Error::write(bucket, object, e.to_string()))?;

        b.generation += 1;
        let generation = b.generation;
        b.objects.insert(
            object.to_string(),
            StoredObject {
                data: payload.to_vec(),
                metadata: metadata.clone(),
                at_rest,
                generation,
            },
        );

        debug!("stored '{}/{}' generation {}", bucket, object, generation);
        Ok(payload.len())
    }

    async fn get_metadata(&self, bucket: &str, object: &str) -> Result<Metadata> {
        let buckets = self.buckets.read();
        let stored = buckets
            .get(bucket)
            .and_then(|b| b.objects.get(object))
            .ok_or_else(|| Error::read(bucket, object, "object not found"))?;
        Ok(stored.metadata.clone())
    }

    async fn get_object(
        &self,
        bucket: &str,
        object: &str,
        key: Option<&DataKey>,
    ) -> Result<(Vec<u8>, ObjectAttrs)> {
        let buckets = self.buckets.read();
        let stored = buckets
            .get(bucket)
            .and_then(|b| b.objects.get(object))
            .ok_or_else(|| Error::read(bucket, object, "object not found"))?;
        check_key(stored, key).map_err(|e| Error::read(bucket, object, e))?;

        Ok((stored.data.clone(), attrs(stored)))
    }

    async fn copy_object(&self, req: CopyRequest<'_>) -> Result<()> {
        let copy_err = |message: String| Error::StorageCopy {
            src_bucket: req.src_bucket.to_string(),
            dst_bucket: req.dst_bucket.to_string(),
            object: req.object.to_string(),
            message,
        };

        // single write lock so a same-path copy swaps atomically
        let mut buckets = self.buckets.write();
        let src = buckets
            .get(req.src_bucket)
            .and_then(|b| b.objects.get(req.object))
            .ok_or_else(|| copy_err(String::from("source object not found")))?;
        check_key(src, req.source_key).map_err(copy_err)?;
        let mut copied = src.clone();

        let dst = buckets
            .get_mut(req.dst_bucket)
            .ok_or_else(|| copy_err(String::from("destination bucket not found")))?;
        copied.at_rest = self
            .at_rest(dst, req.encryption)
            .map_err(|e| copy_err(e.to_string()))?;
        if let Some(metadata) = req.metadata {
            copied.metadata = metadata.clone();
        }
        dst.generation += 1;
        copied.generation = dst.generation;
        dst.objects.insert(req.object.to_string(), copied);

        info!(
            "copied '{}/{}' to '{}/{}'",
            req.src_bucket, req.object, req.dst_bucket, req.object
        );
        Ok(())
    }
}

#[test]
fn test_customer_supplied_key_rules() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let store = Store::new();
    store.create_bucket("b");

    let key = crate::envelope::generate_key().unwrap();
    let other = crate::envelope::generate_key().unwrap();
    let size = ab!(store.put_object(
        "b",
        "o",
        b"payload",
        Encryption::CustomerSupplied(&key),
        &Metadata::new()
    ))
    .unwrap();
    assert_eq!(size, 7);

    let (data, attrs) = ab!(store.get_object("b", "o", Some(&key))).unwrap();
    assert_eq!(data, b"payload");
    assert_eq!(attrs.size, 7);
    assert!(attrs.customer_key_digest.is_some());
    assert!(attrs.kms_key_name.is_none());

    assert!(matches!(
        ab!(store.get_object("b", "o", None)),
        Err(Error::StorageRead { .. })
    ));
    assert!(matches!(
        ab!(store.get_object("b", "o", Some(&other))),
        Err(Error::StorageRead { .. })
    ));

    ab!(store.put_object(
        "b",
        "plain",
        b"payload",
        Encryption::BucketDefault,
        &Metadata::new()
    ))
    .unwrap();
    assert!(ab!(store.get_object("b", "plain", Some(&key))).is_err());

    assert!(matches!(
        ab!(store.put_object(
            "missing",
            "o",
            b"payload",
            Encryption::BucketDefault,
            &Metadata::new()
        )),
        Err(Error::StorageWrite { .. })
    ));
}

#[test]
fn test_copy_to_self_keeps_metadata_and_bumps_generation() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let key_name = "projects/p/locations/global/keyRings/r/cryptoKeys/k";
    let kms = Arc::new(kms::Manager::new());
    kms.create_key(key_name).unwrap();
    let store = Store::with_kms(kms.clone());
    store.create_bucket_with_default_key("b", key_name);

    let mut metadata = Metadata::new();
    metadata.insert(String::from("k"), String::from("v"));
    ab!(store.put_object("b", "o", b"data", Encryption::BucketDefault, &metadata)).unwrap();
    let (_, before) = ab!(store.get_object("b", "o", None)).unwrap();
    assert_eq!(
        before.kms_key_name,
        Some(format!("{}/cryptoKeyVersions/1", key_name))
    );

    kms.rotate(key_name).unwrap();
    ab!(store.copy_object(CopyRequest {
        src_bucket: "b",
        dst_bucket: "b",
        object: "o",
        source_key: None,
        encryption: Encryption::BucketDefault,
        metadata: None,
    }))
    .unwrap();

    let (data, after) = ab!(store.get_object("b", "o", None)).unwrap();
    assert_eq!(data, b"data");
    assert_eq!(
        after.kms_key_name,
        Some(format!("{}/cryptoKeyVersions/2", key_name))
    );
    assert_ne!(before.version, after.version);
    assert_eq!(ab!(store.get_metadata("b", "o")).unwrap(), metadata);
}

use async_trait::async_trait;
use aws_sdk_s3::{
    primitives::ByteStream,
    types::{MetadataDirective, ServerSideEncryption, TaggingDirective},
    Client,
};
use aws_types::SdkConfig;
use base64::{engine::general_purpose::STANDARD, Engine};
use log::{debug, info};
use md5::{Digest, Md5};

use crate::{
    envelope::DataKey,
    errors::{Error, Result},
    storage::{CopyRequest, Encryption, Metadata, ObjectAttrs, ObjectStore},
};

/// SSE-C only supports AES-256.
const SSE_CUSTOMER_ALGORITHM: &str = "AES256";

/// Implements AWS S3 manager.
///
/// Customer-supplied keys map to SSE-C and named KMS keys to SSE-KMS.
/// Custom metadata is kept in object tags, since S3 refuses to return
/// user metadata of an SSE-C object unless the key is presented.
/// Values longer than a tag value are split across numbered tags.
#[derive(Debug, Clone)]
pub struct Manager {
    cli: Client,
}

/// Server-side encryption request parameters.
#[derive(Default)]
struct SseParams {
    customer_algorithm: Option<String>,
    customer_key: Option<String>,
    customer_key_md5: Option<String>,
    server_side_encryption: Option<ServerSideEncryption>,
    kms_key_id: Option<String>,
}

impl SseParams {
    fn customer(key: &DataKey) -> Self {
        Self {
            customer_algorithm: Some(String::from(SSE_CUSTOMER_ALGORITHM)),
            customer_key: Some(STANDARD.encode(key.as_bytes())),
            customer_key_md5: Some(customer_key_md5(key)),
            ..Default::default()
        }
    }

    fn kms(key_id: &str) -> Self {
        Self {
            server_side_encryption: Some(ServerSideEncryption::AwsKms),
            kms_key_id: Some(key_id.to_string()),
            ..Default::default()
        }
    }

    fn from_encryption(encryption: Encryption<'_>) -> Self {
        match encryption {
            Encryption::BucketDefault => Self::default(),
            Encryption::CustomerSupplied(key) => Self::customer(key),
            Encryption::Kms(key_id) => Self::kms(key_id),
        }
    }
}

/// Returns the base64-encoded MD5 digest S3 uses to verify an SSE-C key.
pub fn customer_key_md5(key: &DataKey) -> String {
    STANDARD.encode(Md5::digest(key.as_bytes()))
}

/// S3 limits on an object tag set.
const MAX_TAGS: usize = 10;
const MAX_TAG_KEY_LEN: usize = 128;
const MAX_TAG_VALUE_LEN: usize = 256;

/// Splits metadata into S3 tags. A value longer than one tag value
/// continues in "{key}.1", "{key}.2", and so on.
/// A wrapped DEK from AWS KMS is about 264 base64 characters, so it
/// takes two tags.
pub fn split_tags(metadata: &Metadata) -> std::result::Result<Vec<(String, String)>, String> {
    let mut tags = Vec::new();
    for (k, v) in metadata.iter() {
        if is_continuation(metadata, k) {
            return Err(format!(
                "metadata key '{}' collides with a continuation tag",
                k
            ));
        }

        let chars: Vec<char> = v.chars().collect();
        let chunks: Vec<String> = if chars.is_empty() {
            vec![String::new()]
        } else {
            chars
                .chunks(MAX_TAG_VALUE_LEN)
                .map(|c| c.iter().collect())
                .collect()
        };
        for (i, chunk) in chunks.into_iter().enumerate() {
            let key = if i == 0 {
                k.clone()
            } else {
                format!("{}.{}", k, i)
            };
            if key.chars().count() > MAX_TAG_KEY_LEN {
                return Err(format!(
                    "tag key '{}' exceeds {} characters",
                    key, MAX_TAG_KEY_LEN
                ));
            }
            tags.push((key, chunk));
        }
    }

    if tags.len() > MAX_TAGS {
        return Err(format!(
            "metadata needs {} tags, S3 allows {}",
            tags.len(),
            MAX_TAGS
        ));
    }
    Ok(tags)
}

/// Reassembles metadata written by "split_tags".
pub fn join_tags(tags: Vec<(String, String)>) -> Metadata {
    let tags: Metadata = tags.into_iter().collect();

    let mut metadata = Metadata::new();
    for (k, v) in tags.iter() {
        if is_continuation(&tags, k) {
            continue;
        }
        let mut value = v.clone();
        for i in 1usize.. {
            match tags.get(&format!("{}.{}", k, i)) {
                Some(next) => value.push_str(next),
                None => break,
            }
        }
        metadata.insert(k.clone(), value);
    }
    metadata
}

/// True if "key" is "{base}.{n}" for a "base" present in "keys".
fn is_continuation(keys: &Metadata, key: &str) -> bool {
    match key.rsplit_once('.') {
        Some((base, n)) => {
            !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) && keys.contains_key(base)
        }
        None => false,
    }
}

/// Encodes metadata as an URL-encoded tag set ("k1=v1&k2=v2").
pub fn encode_tagging(metadata: &Metadata) -> std::result::Result<String, String> {
    let tags = split_tags(metadata)?;
    Ok(tags
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                urlencoding::encode(k),
                urlencoding::encode(v)
            )
        })
        .collect::<Vec<_>>()
        .join("&"))
}

impl Manager {
    pub fn new(shared_config: &SdkConfig) -> Self {
        Self {
            cli: Client::new(shared_config),
        }
    }

    /// Loads the default encryption of the bucket as explicit parameters.
    /// A copy onto the same path must change something, so re-encrypting
    /// under the bucket default names the default key explicitly.
    async fn bucket_default_encryption(&self, bucket: &str, object: &str) -> Result<SseParams> {
        let out = self
            .cli
            .get_bucket_encryption()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| Error::read(bucket, object, format!("failed get_bucket_encryption {:?}", e)))?;

        let by_default = out
            .server_side_encryption_configuration()
            .and_then(|c| c.rules())
            .and_then(|rules| rules.first())
            .and_then(|r| r.apply_server_side_encryption_by_default());

        let params = match by_default {
            Some(d) => SseParams {
                server_side_encryption: d.sse_algorithm().cloned(),
                kms_key_id: d.kms_master_key_id().map(|s| s.to_string()),
                ..Default::default()
            },
            None => SseParams {
                server_side_encryption: Some(ServerSideEncryption::Aes256),
                ..Default::default()
            },
        };
        Ok(params)
    }
}

#[async_trait]
impl ObjectStore for Manager {
    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        payload: &[u8],
        encryption: Encryption<'_>,
        metadata: &Metadata,
    ) -> Result<usize> {
        info!(
            "put object '{}/{}' ({} bytes)",
            bucket,
            object,
            payload.len()
        );

        let sse = SseParams::from_encryption(encryption);
        let mut req = self
            .cli
            .put_object()
            .bucket(bucket)
            .key(object)
            .body(ByteStream::from(payload.to_vec()))
            .set_sse_customer_algorithm(sse.customer_algorithm)
            .set_sse_customer_key(sse.customer_key)
            .set_sse_customer_key_md5(sse.customer_key_md5)
            .set_server_side_encryption(sse.server_side_encryption)
            .set_ssekms_key_id(sse.kms_key_id);
        if !metadata.is_empty() {
            let tagging =
                encode_tagging(metadata).map_err(|e| Error::write(bucket, object, e))?;
            req = req.tagging(tagging);
        }

        req.send()
            .await
            .map_err(|e| Error::write(bucket, object, format!("failed put_object {:?}", e)))?;

        Ok(payload.len())
    }

    async fn get_metadata(&self, bucket: &str, object: &str) -> Result<Metadata> {
        debug!("get object tagging '{}/{}'", bucket, object);
        let out = self
            .cli
            .get_object_tagging()
            .bucket(bucket)
            .key(object)
            .send()
            .await
            .map_err(|e| Error::read(bucket, object, format!("failed get_object_tagging {:?}", e)))?;

        let mut tags = Vec::new();
        if let Some(tag_set) = out.tag_set() {
            for tag in tag_set {
                if let (Some(k), Some(v)) = (tag.key(), tag.value()) {
                    tags.push((k.to_string(), v.to_string()));
                }
            }
        }
        Ok(join_tags(tags))
    }

    async fn get_object(
        &self,
        bucket: &str,
        object: &str,
        key: Option<&DataKey>,
    ) -> Result<(Vec<u8>, ObjectAttrs)> {
        info!("get object '{}/{}'", bucket, object);

        let sse = key.map(SseParams::customer).unwrap_or_default();
        let out = self
            .cli
            .get_object()
            .bucket(bucket)
            .key(object)
            .set_sse_customer_algorithm(sse.customer_algorithm)
            .set_sse_customer_key(sse.customer_key)
            .set_sse_customer_key_md5(sse.customer_key_md5)
            .send()
            .await
            .map_err(|e| Error::read(bucket, object, format!("failed get_object {:?}", e)))?;

        let attrs_without_size = ObjectAttrs {
            size: 0,
            kms_key_name: out.ssekms_key_id().map(|s| s.to_string()),
            customer_key_digest: out.sse_customer_key_md5().map(|s| s.to_string()),
            version: out.version_id().map(|s| s.to_string()),
        };

        // reads all the data into memory
        let data = out
            .body
            .collect()
            .await
            .map_err(|e| Error::read(bucket, object, format!("failed to read body {}", e)))?
            .into_bytes()
            .to_vec();

        let attrs = ObjectAttrs {
            size: data.len() as u64,
            ..attrs_without_size
        };
        Ok((data, attrs))
    }

    async fn copy_object(&self, req: CopyRequest<'_>) -> Result<()> {
        info!(
            "copy object '{}/{}' to '{}/{}'",
            req.src_bucket, req.object, req.dst_bucket, req.object
        );
        let copy_err = |message: String| Error::StorageCopy {
            src_bucket: req.src_bucket.to_string(),
            dst_bucket: req.dst_bucket.to_string(),
            object: req.object.to_string(),
            message,
        };

        let same_path = req.src_bucket == req.dst_bucket;
        let sse = match req.encryption {
            Encryption::BucketDefault if same_path => self
                .bucket_default_encryption(req.dst_bucket, req.object)
                .await
                .map_err(|e| copy_err(e.message()))?,
            encryption => SseParams::from_encryption(encryption),
        };
        let src_sse = req.source_key.map(SseParams::customer).unwrap_or_default();
        let tagging = match req.metadata {
            Some(metadata) => Some(encode_tagging(metadata).map_err(copy_err)?),
            None => None,
        };

        let mut copy = self
            .cli
            .copy_object()
            .copy_source(format!(
                "{}/{}",
                req.src_bucket,
                urlencoding::encode(req.object)
            ))
            .bucket(req.dst_bucket)
            .key(req.object)
            .metadata_directive(MetadataDirective::Copy)
            .set_copy_source_sse_customer_algorithm(src_sse.customer_algorithm)
            .set_copy_source_sse_customer_key(src_sse.customer_key)
            .set_copy_source_sse_customer_key_md5(src_sse.customer_key_md5)
            .set_sse_customer_algorithm(sse.customer_algorithm)
            .set_sse_customer_key(sse.customer_key)
            .set_sse_customer_key_md5(sse.customer_key_md5)
            .set_server_side_encryption(sse.server_side_encryption)
            .set_ssekms_key_id(sse.kms_key_id);
        copy = match tagging {
            Some(tagging) => copy
                .tagging_directive(TaggingDirective::Replace)
                .tagging(tagging),
            None => copy.tagging_directive(TaggingDirective::Copy),
        };

        copy.send()
            .await
            .map_err(|e| copy_err(format!("failed copy_object {:?}", e)))?;

        Ok(())
    }
}

#[test]
fn test_encode_tagging() {
    let mut metadata = Metadata::new();
    assert_eq!(encode_tagging(&metadata).unwrap(), "");

    metadata.insert(String::from("wDEK"), String::from("YWJj+/=="));
    metadata.insert(
        String::from("cryptKey"),
        String::from("arn:aws:kms:us-west-2:123:key/k 1"),
    );
    assert_eq!(
        encode_tagging(&metadata).unwrap(),
        "cryptKey=arn%3Aaws%3Akms%3Aus-west-2%3A123%3Akey%2Fk%201&wDEK=YWJj%2B%2F%3D%3D"
    );
}

#[test]
fn test_split_join_wrapped_key_tags() {
    // AWS KMS returns about 196 bytes for the base64 form of a 32-byte key
    let wrapped = STANDARD.encode([7u8; 196]);
    assert_eq!(wrapped.len(), 264);

    let mut metadata = Metadata::new();
    metadata.insert(String::from("wDEK"), wrapped.clone());
    metadata.insert(
        String::from("cryptKey"),
        String::from(
            "arn:aws:kms:us-west-2:123456789012:key/1234abcd-12ab-34cd-56ef-1234567890ab",
        ),
    );

    let tags = split_tags(&metadata).unwrap();
    assert_eq!(tags.len(), 3);
    for (k, v) in tags.iter() {
        assert!(k.len() <= MAX_TAG_KEY_LEN);
        assert!(v.len() <= MAX_TAG_VALUE_LEN);
    }
    assert_eq!(tags[1], (String::from("wDEK"), wrapped[..256].to_string()));
    assert_eq!(tags[2], (String::from("wDEK.1"), wrapped[256..].to_string()));

    // tag order is not preserved by S3
    let mut reversed = tags.clone();
    reversed.reverse();
    assert_eq!(join_tags(reversed), metadata);

    let tagging = encode_tagging(&metadata).unwrap();
    assert!(tagging.contains("&wDEK.1="));

    let mut empty = Metadata::new();
    empty.insert(String::from("wDEK"), String::new());
    assert_eq!(join_tags(split_tags(&empty).unwrap()), empty);
}

#[test]
fn test_split_tags_limits() {
    let mut metadata = Metadata::new();
    metadata.insert(String::from("wDEK"), "A".repeat(MAX_TAG_VALUE_LEN * MAX_TAGS + 1));
    assert!(split_tags(&metadata).is_err());
    assert!(encode_tagging(&metadata).is_err());

    let mut metadata = Metadata::new();
    metadata.insert("k".repeat(MAX_TAG_KEY_LEN + 1), String::from("v"));
    assert!(split_tags(&metadata).is_err());

    // a real key must not read back as a continuation
    let mut metadata = Metadata::new();
    metadata.insert(String::from("wDEK"), String::from("a"));
    metadata.insert(String::from("wDEK.1"), String::from("b"));
    assert!(split_tags(&metadata).is_err());
}

#[test]
fn test_customer_key_md5() {
    let key = DataKey::from_slice(&[0u8; 32]).unwrap();
    // md5 of 32 zero bytes
    assert_eq!(customer_key_md5(&key), "cLyPS3KoaSFGi/joRB3OUQ==");

    let params = SseParams::customer(&key);
    assert_eq!(params.customer_algorithm.as_deref(), Some("AES256"));
    assert_eq!(
        params.customer_key.as_deref(),
        Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
    );
    assert!(params.server_side_encryption.is_none());
}

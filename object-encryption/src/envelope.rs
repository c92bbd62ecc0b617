use std::{fmt, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine};
use log::info;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    errors::{Error::Encoding, Result},
    kms::KeyManagementService,
    random,
};

/// AES-256 data encryption key length in bytes.
pub const DEK_AES_256_LENGTH: usize = 32;

/// Represents the data encryption key (DEK).
/// Exists only in memory and is zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct DataKey([u8; DEK_AES_256_LENGTH]);

impl DataKey {
    pub fn from_slice(d: &[u8]) -> Result<Self> {
        if d.len() != DEK_AES_256_LENGTH {
            return Err(Encoding {
                message: format!(
                    "DEK for AES_256 must be {}-byte, got {}-byte",
                    DEK_AES_256_LENGTH,
                    d.len()
                ),
            });
        }
        let mut key = [0u8; DEK_AES_256_LENGTH];
        key.copy_from_slice(d);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the standard base64 encoding of the raw key.
    pub fn encode_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.0))
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}

/// Generates a fresh 256-bit data encryption key.
pub fn generate_key() -> Result<DataKey> {
    let mut key = DataKey([0u8; DEK_AES_256_LENGTH]);
    random::fill(&mut key.0)?;
    Ok(key)
}

/// Wrapped form of a DEK, safe to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    /// Base64-encoded KMS ciphertext.
    pub ciphertext: String,
    /// Key version resource name reported by the KMS.
    pub key_version: String,
}

/// Implements envelope key manager.
#[derive(Clone)]
pub struct Manager {
    kms: Arc<dyn KeyManagementService>,
}

impl Manager {
    pub fn new(kms: Arc<dyn KeyManagementService>) -> Self {
        Self { kms }
    }

    /// Wraps the DEK under the master key.
    /// The KMS encrypts the base64 form of the key, not the raw bytes.
    pub async fn wrap(&self, key_name: &str, key: &DataKey) -> Result<WrappedKey> {
        info!("wrapping data encryption key with '{}'", key_name);
        let plaintext = key.encode_base64();
        let encrypted = self.kms.encrypt(key_name, plaintext.as_bytes()).await?;

        Ok(WrappedKey {
            ciphertext: STANDARD.encode(&encrypted.ciphertext),
            key_version: encrypted.key_version,
        })
    }

    /// Unwraps the base64-encoded ciphertext back to the raw DEK.
    pub async fn unwrap(&self, key_name: &str, ciphertext: &str) -> Result<DataKey> {
        info!("unwrapping data encryption key with '{}'", key_name);
        let cipher = STANDARD.decode(ciphertext).map_err(|e| Encoding {
            message: format!("wrapped key is not valid base64 ({})", e),
        })?;

        let plaintext = Zeroizing::new(self.kms.decrypt(key_name, &cipher).await?);
        let raw = Zeroizing::new(STANDARD.decode(plaintext.as_slice()).map_err(|e| Encoding {
            message: format!("decrypted key is not valid base64 ({})", e),
        })?);
        DataKey::from_slice(&raw)
    }
}

#[cfg(test)]
fn test_manager() -> (Manager, String) {
    let kms = Arc::new(crate::memory::kms::Manager::new());
    let key_name = "projects/p/locations/global/keyRings/r/cryptoKeys/k";
    kms.create_key(key_name).unwrap();
    (Manager::new(kms), key_name.to_string())
}

#[test]
fn test_generate_key() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..1000 {
        let key = generate_key().unwrap();
        assert_eq!(key.as_bytes().len(), DEK_AES_256_LENGTH);
        assert!(seen.insert(key.as_bytes().to_vec()));
    }
}

#[test]
fn test_data_key_debug_redacted() {
    let key = DataKey::from_slice(&[7u8; DEK_AES_256_LENGTH]).unwrap();
    assert_eq!(format!("{:?}", key), "DataKey(<redacted>)");
    assert!(DataKey::from_slice(&[7u8; 16]).is_err());
}

#[test]
fn test_wrap_unwrap() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let (manager, key_name) = test_manager();
    let key = generate_key().unwrap();

    let wrapped = ab!(manager.wrap(&key_name, &key)).unwrap();
    assert_eq!(
        wrapped.key_version,
        format!("{}/cryptoKeyVersions/1", key_name)
    );
    assert_ne!(wrapped.ciphertext, *key.encode_base64());

    let unwrapped = ab!(manager.unwrap(&key_name, &wrapped.ciphertext)).unwrap();
    assert_eq!(unwrapped, key);

    // wrapping is randomized
    let wrapped2 = ab!(manager.wrap(&key_name, &key)).unwrap();
    assert_ne!(wrapped.ciphertext, wrapped2.ciphertext);
}

#[test]
fn test_unwrap_errors() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let (manager, key_name) = test_manager();

    let ret = ab!(manager.unwrap(&key_name, "not base64!"));
    assert!(matches!(ret, Err(Encoding { .. })));

    let ret = ab!(manager.unwrap(&key_name, &STANDARD.encode(b"garbage ciphertext")));
    assert!(matches!(
        ret,
        Err(crate::errors::Error::KeyManagement { .. })
    ));

    let key = generate_key().unwrap();
    let ret = ab!(manager.wrap("projects/p/locations/global/keyRings/r/cryptoKeys/missing", &key));
    assert!(matches!(
        ret,
        Err(crate::errors::Error::KeyManagement { .. })
    ));
}

#[test]
fn test_unwrap_non_base64_plaintext() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let kms = Arc::new(crate::memory::kms::Manager::new());
    let key_name = "projects/p/locations/global/keyRings/r/cryptoKeys/k";
    kms.create_key(key_name).unwrap();

    // plaintext that was never base64-encoded
    let encrypted = ab!(kms.encrypt(key_name, b"\x00\x01raw-bytes")).unwrap();
    let manager = Manager::new(kms);
    let ret = ab!(manager.unwrap(key_name, &STANDARD.encode(&encrypted.ciphertext)));
    assert!(matches!(ret, Err(Encoding { .. })));
}

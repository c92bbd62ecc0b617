use std::{
    collections::HashMap,
    io::{Cursor, Read},
};

use async_trait::async_trait;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use parking_lot::RwLock;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use zeroize::Zeroizing;

use crate::{
    errors::{Error, Result},
    kms::{Encrypted, KeyManagementService, ResourceName},
    random,
};

const KEY_LEN: usize = 32;

/// In-process key-management emulator.
/// Each key keeps every version it ever had; the last one is primary.
/// Ciphertexts are laid out as:
/// [ key version "u32" ][ Nonce bytes ][ AES_256_GCM ciphertext + tag ]
#[derive(Default)]
pub struct Manager {
    keys: RwLock<HashMap<String, Vec<Zeroizing<[u8; KEY_LEN]>>>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a key with its first version and returns the version name.
    /// Creating an existing key is a no-op that returns the primary version.
    pub fn create_key(&self, key_name: &str) -> Result<String> {
        let name: ResourceName = key_name.parse()?;
        let mut keys = self.keys.write();
        if let Some(versions) = keys.get(key_name) {
            return Ok(name.version(versions.len()));
        }

        info!("creating key '{}'", key_name);
        keys.insert(key_name.to_string(), vec![new_version()?]);
        Ok(name.version(1))
    }

    /// Adds a new primary version. Older versions stay usable for decryption.
    pub fn rotate(&self, key_name: &str) -> Result<String> {
        let name: ResourceName = key_name.parse()?;
        let mut keys = self.keys.write();
        let versions = keys
            .get_mut(key_name)
            .ok_or_else(|| Error::kms(key_name, "key not found"))?;
        versions.push(new_version()?);

        info!("rotated key '{}' to version {}", key_name, versions.len());
        Ok(name.version(versions.len()))
    }

    /// Returns the resource name of the primary version.
    pub fn primary_version(&self, key_name: &str) -> Result<String> {
        let name: ResourceName = key_name.parse()?;
        let keys = self.keys.read();
        let versions = keys
            .get(key_name)
            .ok_or_else(|| Error::kms(key_name, "key not found"))?;
        Ok(name.version(versions.len()))
    }

    fn sealing_key(
        &self,
        key_name: &str,
        version: Option<usize>,
    ) -> Result<(LessSafeKey, usize)> {
        let keys = self.keys.read();
        let versions = keys
            .get(key_name)
            .ok_or_else(|| Error::kms(key_name, "key not found"))?;

        let n = version.unwrap_or(versions.len());
        if n == 0 || n > versions.len() {
            return Err(Error::kms(key_name, format!("key version {} not found", n)));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, &versions[n - 1][..])
            .map_err(|e| Error::kms(key_name, format!("failed to create UnboundKey ({:?})", e)))?;
        Ok((LessSafeKey::new(unbound), n))
    }
}

fn new_version() -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    random::fill(&mut *key)?;
    Ok(key)
}

#[async_trait]
impl KeyManagementService for Manager {
    async fn encrypt(&self, key_name: &str, plaintext: &[u8]) -> Result<Encrypted> {
        let name: ResourceName = key_name
            .parse()
            .map_err(|e: Error| Error::kms(key_name, e.message()))?;
        let (key, version) = self.sealing_key(key_name, None)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        random::fill(&mut nonce_bytes)?;

        let mut sealed = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(key_name.as_bytes()),
            &mut sealed,
        )
        .map_err(|e| Error::kms(key_name, format!("failed to seal ({:?})", e)))?;

        let mut ciphertext = Vec::with_capacity(4 + NONCE_LEN + sealed.len());
        ciphertext
            .write_u32::<LittleEndian>(version as u32)
            .map_err(|e| Error::kms(key_name, format!("failed to write ({:?})", e)))?;
        ciphertext.extend_from_slice(&nonce_bytes);
        ciphertext.extend_from_slice(&sealed);

        Ok(Encrypted {
            ciphertext,
            key_version: name.version(version),
        })
    }

    async fn decrypt(&self, key_name: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(ciphertext);
        let version = buf
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::kms(key_name, format!("failed to read key version ({:?})", e)))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        buf.read_exact(&mut nonce_bytes)
            .map_err(|e| Error::kms(key_name, format!("failed to read nonce ({:?})", e)))?;

        let mut sealed = Vec::new();
        buf.read_to_end(&mut sealed)
            .map_err(|e| Error::kms(key_name, format!("failed to read ciphertext ({:?})", e)))?;

        let (key, _) = self.sealing_key(key_name, Some(version as usize))?;
        let plaintext = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(key_name.as_bytes()),
                &mut sealed,
            )
            .map_err(|e| Error::kms(key_name, format!("failed to open ({:?})", e)))?;
        Ok(plaintext.to_vec())
    }
}

#[test]
fn test_encrypt_decrypt_rotate() {
    let _ = env_logger::builder().is_test(true).try_init();

    macro_rules! ab {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    let key_name = "projects/p/locations/global/keyRings/r/cryptoKeys/k";
    let kms = Manager::new();
    assert!(kms.create_key("not-a-resource-name").is_err());
    assert_eq!(
        kms.create_key(key_name).unwrap(),
        format!("{}/cryptoKeyVersions/1", key_name)
    );

    let v1 = ab!(kms.encrypt(key_name, b"hello")).unwrap();
    assert!(v1.key_version.ends_with("/cryptoKeyVersions/1"));

    let v2_name = kms.rotate(key_name).unwrap();
    assert!(v2_name.ends_with("/cryptoKeyVersions/2"));
    assert_eq!(kms.primary_version(key_name).unwrap(), v2_name);
    // re-creating keeps the rotated state
    assert_eq!(kms.create_key(key_name).unwrap(), v2_name);

    let v2 = ab!(kms.encrypt(key_name, b"hello")).unwrap();
    assert_eq!(v2.key_version, v2_name);

    // old ciphertexts stay decryptable after rotation
    assert_eq!(ab!(kms.decrypt(key_name, &v1.ciphertext)).unwrap(), b"hello");
    assert_eq!(ab!(kms.decrypt(key_name, &v2.ciphertext)).unwrap(), b"hello");

    // bound to the key name
    let other = "projects/p/locations/global/keyRings/r/cryptoKeys/other";
    kms.create_key(other).unwrap();
    assert!(ab!(kms.decrypt(other, &v2.ciphertext)).is_err());

    let mut tampered = v2.ciphertext.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0xff;
    assert!(ab!(kms.decrypt(key_name, &tampered)).is_err());
    assert!(ab!(kms.decrypt(key_name, &[1, 2])).is_err());
}

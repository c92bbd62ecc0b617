use async_trait::async_trait;
use aws_sdk_kms::{primitives::Blob, types::EncryptionAlgorithmSpec, Client};
use aws_types::SdkConfig;
use log::info;

use crate::{
    errors::{Error, Result},
    kms::{Encrypted, KeyManagementService},
};

/// Implements AWS KMS manager.
/// "key_name" is a key ID, key ARN, alias name, or alias ARN.
#[derive(Debug, Clone)]
pub struct Manager {
    cli: Client,
}

impl Manager {
    pub fn new(shared_config: &SdkConfig) -> Self {
        Self {
            cli: Client::new(shared_config),
        }
    }
}

#[async_trait]
impl KeyManagementService for Manager {
    /// Encrypts data with "SYMMETRIC_DEFAULT". The maximum plaintext size is
    /// 4096 bytes, well above a base64-encoded 256-bit key.
    /// The returned key version is the key ARN that KMS resolved.
    /// ref. https://docs.aws.amazon.com/kms/latest/APIReference/API_Encrypt.html
    async fn encrypt(&self, key_name: &str, plaintext: &[u8]) -> Result<Encrypted> {
        info!(
            "encrypting data with '{}' (plaintext size {})",
            key_name,
            plaintext.len()
        );

        let resp = self
            .cli
            .encrypt()
            .key_id(key_name)
            .plaintext(Blob::new(plaintext.to_vec()))
            .encryption_algorithm(EncryptionAlgorithmSpec::SymmetricDefault)
            .send()
            .await
            .map_err(|e| Error::kms(key_name, format!("failed encrypt {:?}", e)))?;

        let ciphertext = match resp.ciphertext_blob() {
            Some(v) => v.clone().into_inner(),
            None => {
                return Err(Error::kms(
                    key_name,
                    "EncryptOutput.ciphertext_blob not found",
                ));
            }
        };
        let key_version = resp.key_id().unwrap_or(key_name).to_string();

        info!(
            "encrypted data with '{}' (ciphertext size {})",
            key_version,
            ciphertext.len()
        );
        Ok(Encrypted {
            ciphertext,
            key_version,
        })
    }

    /// Decrypts data. The maximum length of "ciphertext" is 6144 bytes.
    /// ref. https://docs.aws.amazon.com/kms/latest/APIReference/API_Decrypt.html
    async fn decrypt(&self, key_name: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        info!(
            "decrypting data with '{}' (ciphertext size {})",
            key_name,
            ciphertext.len()
        );

        let resp = self
            .cli
            .decrypt()
            .key_id(key_name)
            .ciphertext_blob(Blob::new(ciphertext.to_vec()))
            .encryption_algorithm(EncryptionAlgorithmSpec::SymmetricDefault)
            .send()
            .await
            .map_err(|e| Error::kms(key_name, format!("failed decrypt {:?}", e)))?;

        match resp.plaintext() {
            Some(v) => Ok(v.clone().into_inner()),
            None => Err(Error::kms(key_name, "DecryptOutput.plaintext not found")),
        }
    }
}

use std::{fmt, str::FromStr};

use async_trait::async_trait;

use crate::errors::{Error::Encoding, Result};

/// Output of a key-management "encrypt" call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encrypted {
    pub ciphertext: Vec<u8>,
    /// Resource name of the key (version) that produced the ciphertext.
    pub key_version: String,
}

/// Key-management service used to wrap and unwrap data encryption keys.
/// Implementations are long-lived handles shared across requests.
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    /// Encrypts "plaintext" under the master key "key_name".
    async fn encrypt(&self, key_name: &str, plaintext: &[u8]) -> Result<Encrypted>;

    /// Decrypts "ciphertext" that was produced under the master key "key_name".
    async fn decrypt(&self, key_name: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Four-segment master key resource path.
/// e.g., "projects/my-project/locations/global/keyRings/my-ring/cryptoKeys/my-key"
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName {
    pub project: String,
    pub location: String,
    pub key_ring: String,
    pub crypto_key: String,
}

const SEGMENTS: [&str; 4] = ["projects", "locations", "keyRings", "cryptoKeys"];

impl FromStr for ResourceName {
    type Err = crate::errors::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != SEGMENTS.len() * 2 {
            return Err(Encoding {
                message: format!(
                    "key name '{}' must have {} segments, got {}",
                    s,
                    SEGMENTS.len() * 2,
                    parts.len()
                ),
            });
        }

        let mut values = Vec::with_capacity(SEGMENTS.len());
        for (i, expected) in SEGMENTS.iter().enumerate() {
            let (label, value) = (parts[i * 2], parts[i * 2 + 1]);
            if label != *expected {
                return Err(Encoding {
                    message: format!("key name '{}' expected '{}', got '{}'", s, expected, label),
                });
            }
            if value.is_empty() {
                return Err(Encoding {
                    message: format!("key name '{}' has empty '{}'", s, expected),
                });
            }
            values.push(value.to_string());
        }

        let mut values = values.into_iter();
        Ok(Self {
            project: values.next().unwrap_or_default(),
            location: values.next().unwrap_or_default(),
            key_ring: values.next().unwrap_or_default(),
            crypto_key: values.next().unwrap_or_default(),
        })
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}",
            self.project, self.location, self.key_ring, self.crypto_key
        )
    }
}

impl ResourceName {
    /// Returns the resource name of a specific key version (1-based).
    pub fn version(&self, n: usize) -> String {
        format!("{}/cryptoKeyVersions/{}", self, n)
    }
}

#[test]
fn test_resource_name() {
    let s = "projects/p1/locations/global/keyRings/ring/cryptoKeys/key";
    let name: ResourceName = s.parse().unwrap();
    assert_eq!(name.project, "p1");
    assert_eq!(name.location, "global");
    assert_eq!(name.key_ring, "ring");
    assert_eq!(name.crypto_key, "key");
    assert_eq!(name.to_string(), s);
    assert_eq!(name.version(3), format!("{}/cryptoKeyVersions/3", s));

    assert!("projects/p1/locations/global/keyRings/ring"
        .parse::<ResourceName>()
        .is_err());
    assert!("projects/p1/locations/global/rings/ring/cryptoKeys/key"
        .parse::<ResourceName>()
        .is_err());
    assert!("projects//locations/global/keyRings/ring/cryptoKeys/key"
        .parse::<ResourceName>()
        .is_err());
}

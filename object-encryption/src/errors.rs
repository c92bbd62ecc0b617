use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Backing errors for all envelope and storage operations.
/// Every failure is terminal for the request; nothing is retried.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read system random source ({message})")]
    RandomSource { message: String },
    #[error("failed key management call for '{key_name}' ({message})")]
    KeyManagement { key_name: String, message: String },
    #[error("invalid encoding ({message})")]
    Encoding { message: String },
    #[error("object '{bucket}/{object}' has no wrapped data encryption key in metadata")]
    MissingKeyMetadata { bucket: String, object: String },
    #[error("failed to read object '{bucket}/{object}' ({message})")]
    StorageRead {
        bucket: String,
        object: String,
        message: String,
    },
    #[error("failed to write object '{bucket}/{object}' ({message})")]
    StorageWrite {
        bucket: String,
        object: String,
        message: String,
    },
    #[error("failed to copy object '{src_bucket}/{object}' to '{dst_bucket}' ({message})")]
    StorageCopy {
        src_bucket: String,
        dst_bucket: String,
        object: String,
        message: String,
    },
}

impl Error {
    /// Returns the error message in "String".
    #[inline]
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Error::RandomSource { message }
            | Error::KeyManagement { message, .. }
            | Error::Encoding { message }
            | Error::StorageRead { message, .. }
            | Error::StorageWrite { message, .. }
            | Error::StorageCopy { message, .. } => message.clone(),
            Error::MissingKeyMetadata { .. } => self.to_string(),
        }
    }

    pub(crate) fn read(bucket: &str, object: &str, message: impl Into<String>) -> Self {
        Error::StorageRead {
            bucket: bucket.to_string(),
            object: object.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn write(bucket: &str, object: &str, message: impl Into<String>) -> Self {
        Error::StorageWrite {
            bucket: bucket.to_string(),
            object: object.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn kms(key_name: &str, message: impl Into<String>) -> Self {
        Error::KeyManagement {
            key_name: key_name.to_string(),
            message: message.into(),
        }
    }
}

#[test]
fn test_error_message() {
    let e = Error::kms("projects/p/locations/l/keyRings/r/cryptoKeys/k", "denied");
    assert_eq!(e.message(), "denied");
    assert!(e.to_string().contains("cryptoKeys/k"));

    let e = Error::MissingKeyMetadata {
        bucket: String::from("b"),
        object: String::from("o"),
    };
    assert!(e.message().contains("b/o"));
}

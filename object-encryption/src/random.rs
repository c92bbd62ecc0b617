use lazy_static::lazy_static;
use ring::rand::{SecureRandom, SystemRandom};

use crate::errors::{Error::RandomSource, Result};

/// Fills the buffer from the system entropy source.
pub fn fill(d: &mut [u8]) -> Result<()> {
    secure_random().fill(d).map_err(|e| RandomSource {
        message: format!("failed to generate ring.random ({:?})", e),
    })
}

/// Generates "n" random bytes.
pub fn bytes(n: usize) -> Result<Vec<u8>> {
    let mut d: Vec<u8> = vec![0u8; n];
    fill(&mut d)?;
    Ok(d)
}

fn secure_random() -> &'static dyn SecureRandom {
    use std::ops::Deref;
    lazy_static! {
        static ref RANDOM: SystemRandom = SystemRandom::new();
    }
    RANDOM.deref()
}

#[test]
fn test_bytes() {
    let _ = env_logger::builder().is_test(true).try_init();

    let b1 = bytes(64).unwrap();
    let b2 = bytes(64).unwrap();

    assert_eq!(b1.len(), 64);
    assert_eq!(b2.len(), 64);
    assert_ne!(b1, b2);
    assert!(bytes(0).unwrap().is_empty());
}

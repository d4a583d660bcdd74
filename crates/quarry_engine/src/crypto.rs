//! Passphrase handling for encrypted environments.
//!
//! The passphrase never outlives [`derive_key`]: callers pass it in a
//! [`Zeroizing`] wrapper and the derived key is itself zeroized on drop.

use crate::error::{EngineError, EngineResult};
use hkdf::Hkdf;
use quarry_storage::{EncryptionKey, KEY_SIZE};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Length of the per-environment salt.
pub(crate) const SALT_SIZE: usize = 16;

/// Plaintext stored in the verifier file. Decrypting it proves the passphrase.
pub(crate) const VERIFIER: &[u8] = b"quarry-environment-verifier-v1";

const KEY_INFO: &[u8] = b"quarry-encryption-key-v1";

/// Derives the environment key from a passphrase and the stored salt.
///
/// Consumes the passphrase; its buffer is wiped when this returns.
pub(crate) fn derive_key(password: Zeroizing<String>, salt: &[u8]) -> EngineResult<EncryptionKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), password.as_bytes());
    let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(KEY_INFO, bytes.as_mut())
        .map_err(|_| EngineError::invalid_argument("HKDF expand failed"))?;
    Ok(EncryptionKey::from_bytes(bytes.as_ref())?)
}

/// Generates a fresh random salt.
pub(crate) fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pw(s: &str) -> Zeroizing<String> {
        Zeroizing::new(s.to_string())
    }

    #[test]
    fn derivation_is_deterministic_per_salt() {
        let salt = [7u8; SALT_SIZE];
        let a = derive_key(pw("secret"), &salt).unwrap();
        let b = derive_key(pw("secret"), &salt).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());

        let c = derive_key(pw("secret"), &[8u8; SALT_SIZE]).unwrap();
        assert_ne!(a.as_bytes(), c.as_bytes());
        let d = derive_key(pw("other"), &salt).unwrap();
        assert_ne!(a.as_bytes(), d.as_bytes());
    }

    #[test]
    fn salts_differ() {
        assert_ne!(generate_salt(), generate_salt());
    }
}

//! `aes128-cts-hmac-sha1-96` (17) and `aes256-cts-hmac-sha1-96` (18) on top
//! of the `kerberos_crypto` ciphers. Other enctypes are refused before any
//! bytes reach the cipher.

use super::Error;
use kerberos_crypto::{AesSizes, KerberosCipher, checksum_sha_aes, new_kerberos_cipher};
use secrecy::{ExposeSecret, SecretSlice};
use std::fmt;

/// Confounder plus truncated HMAC: the smallest valid ciphertext.
const MIN_CIPHERTEXT: usize = 16 + 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncType {
    Aes128CtsHmacSha196,
    Aes256CtsHmacSha196,
}

impl EncType {
    /// # Errors
    /// Returns `UnsupportedEtype` for anything but 17 and 18.
    pub fn from_code(code: i32) -> Result<Self, Error> {
        match code {
            17 => Ok(Self::Aes128CtsHmacSha196),
            18 => Ok(Self::Aes256CtsHmacSha196),
            other => Err(Error::UnsupportedEtype(other)),
        }
    }

    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Aes128CtsHmacSha196 => 17,
            Self::Aes256CtsHmacSha196 => 18,
        }
    }

    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes128CtsHmacSha196 => 16,
            Self::Aes256CtsHmacSha196 => 32,
        }
    }

    /// The keyed `hmac-sha1-96-aes*` checksum type paired with this enctype.
    #[must_use]
    pub const fn checksum_type(self) -> i32 {
        match self {
            Self::Aes128CtsHmacSha196 => 15,
            Self::Aes256CtsHmacSha196 => 16,
        }
    }

    const fn aes_sizes(self) -> AesSizes {
        match self {
            Self::Aes128CtsHmacSha196 => AesSizes::Aes128,
            Self::Aes256CtsHmacSha196 => AesSizes::Aes256,
        }
    }
}

/// A session or long-term key. The bytes never appear in `Debug` output.
pub struct EncryptionKey {
    pub etype: i32,
    value: SecretSlice<u8>,
}

impl EncryptionKey {
    #[must_use]
    pub fn new(etype: i32, value: Vec<u8>) -> Self {
        Self {
            etype,
            value: SecretSlice::from(value),
        }
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        self.value.expose_secret()
    }

    /// # Errors
    /// Returns an error when the key's enctype is not supported.
    pub fn enctype(&self) -> Result<EncType, Error> {
        EncType::from_code(self.etype)
    }

    /// The enctype, once the key length has been checked against it.
    fn checked(&self) -> Result<EncType, Error> {
        let etype = self.enctype()?;
        if self.value().len() == etype.key_len() {
            Ok(etype)
        } else {
            Err(Error::KeyLength)
        }
    }
}

impl Clone for EncryptionKey {
    fn clone(&self) -> Self {
        Self::new(self.etype, self.value().to_vec())
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("etype", &self.etype)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

fn cipher(etype: EncType) -> Result<Box<dyn KerberosCipher>, Error> {
    new_kerberos_cipher(etype.code()).map_err(|e| Error::Crypto(format!("{e:?}")))
}

/// Encrypt `plaintext` under `key` for the given key usage. A fresh random
/// confounder is drawn on every call.
///
/// # Errors
/// Returns an error for unsupported enctypes or a key of the wrong length.
pub fn encrypt(key: &EncryptionKey, usage: i32, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let etype = key.checked()?;
    Ok(cipher(etype)?.encrypt(key.value(), usage, plaintext))
}

/// Decrypt and verify `ciphertext`, returning the plaintext without confounder.
///
/// # Errors
/// Returns `Integrity` when the HMAC does not verify.
pub fn decrypt(key: &EncryptionKey, usage: i32, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    let etype = key.checked()?;
    if ciphertext.len() < MIN_CIPHERTEXT {
        return Err(Error::ShortCiphertext);
    }
    cipher(etype)?
        .decrypt(key.value(), usage, ciphertext)
        .map_err(|_| Error::Integrity)
}

/// Keyed `hmac-sha1-96-aes` checksum over `data`.
///
/// # Errors
/// Returns an error for unsupported enctypes or a key of the wrong length.
pub fn checksum(key: &EncryptionKey, usage: i32, data: &[u8]) -> Result<Vec<u8>, Error> {
    let etype = key.checked()?;
    Ok(checksum_sha_aes(key.value(), usage, data, &etype.aes_sizes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(etype: EncType) -> EncryptionKey {
        EncryptionKey::new(
            etype.code(),
            (0..etype.key_len()).map(|i| (i * 7) as u8).collect(),
        )
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn roundtrip_across_block_boundaries() {
        for etype in [EncType::Aes128CtsHmacSha196, EncType::Aes256CtsHmacSha196] {
            let key = key(etype);
            for len in [0, 1, 15, 16, 17, 33, 100] {
                let plain: Vec<u8> = (0..len).map(|i| (i * 3) as u8).collect();
                let sealed = encrypt(&key, 11, &plain).unwrap();
                assert_eq!(sealed.len(), MIN_CIPHERTEXT + len);
                assert_eq!(decrypt(&key, 11, &sealed).unwrap(), plain);
            }
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn every_encryption_uses_a_new_confounder() {
        let key = key(EncType::Aes128CtsHmacSha196);
        let a = encrypt(&key, 7, b"authenticator").unwrap();
        let b = encrypt(&key, 7, b"authenticator").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn tampering_or_wrong_usage_fails_integrity() {
        let key = EncryptionKey::new(18, vec![0x11; 32]);
        let mut sealed = encrypt(&key, 8, b"enc-part").unwrap();
        assert!(matches!(decrypt(&key, 7, &sealed), Err(Error::Integrity)));
        sealed[3] ^= 0x01;
        assert!(matches!(decrypt(&key, 8, &sealed), Err(Error::Integrity)));
        assert!(matches!(decrypt(&key, 8, &sealed[..20]), Err(Error::ShortCiphertext)));
    }

    #[test]
    fn key_length_and_enctype_are_checked() {
        assert!(matches!(
            encrypt(&EncryptionKey::new(18, vec![0; 16]), 11, b"x"),
            Err(Error::KeyLength)
        ));
        assert!(matches!(
            encrypt(&EncryptionKey::new(23, vec![0; 16]), 11, b"x"),
            Err(Error::UnsupportedEtype(23))
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn checksum_depends_on_usage() {
        let key = EncryptionKey::new(17, vec![0x24; 16]);
        let six = checksum(&key, 6, b"req-body").unwrap();
        let seven = checksum(&key, 7, b"req-body").unwrap();
        assert_eq!(six.len(), 12);
        assert_ne!(six, seven);
        assert_eq!(six, checksum(&key, 6, b"req-body").unwrap());
    }

    #[test]
    fn debug_never_prints_key_bytes() {
        let key = EncryptionKey::new(18, vec![0xab; 32]);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("171"));
    }
}

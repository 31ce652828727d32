//! Credential encryption.
//!
//! Secrets are sealed with AES-256-GCM. The owning account's ID is bound as
//! associated data, so an envelope copied onto another record fails
//! authentication instead of decrypting to a foreign credential.
//!
//! Envelope format: `nonce:tag:ciphertext`, each segment lowercase hex
//! (12-byte nonce, 16-byte tag).
//!
//! The master key is injected at construction. It can be provisioned from
//! hex configuration or from the platform's native credential storage:
//! - Linux: Secret Service (GNOME Keyring, `KWallet`)
//! - macOS: Keychain
//! - Windows: Credential Manager

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use keyring::Entry;
use tracing::debug;

use super::AccountId;

/// Service name used for keyring entries.
const SERVICE_NAME: &str = "mailbridge";

/// Keyring entry holding the hex-encoded master key.
const MASTER_KEY_ENTRY: &str = "master_key";

/// AES-256 key size in bytes.
pub const KEY_LEN: usize = 32;

/// Nonce size for AES-GCM (96 bits / 12 bytes).
const NONCE_LEN: usize = 12;

/// Authentication tag size for AES-GCM.
const TAG_LEN: usize = 16;

const SEGMENT_SEPARATOR: char = ':';

/// Error type for credential encryption.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Envelope is not `nonce:tag:ciphertext` hex.
    #[error("Malformed credential envelope: {0}")]
    Format(String),

    /// Tag check failed: wrong key, wrong record, or tampered data.
    #[error("Credential envelope failed authentication")]
    Authentication,

    /// Encryption itself failed.
    #[error("Encryption failed")]
    Encryption,

    /// The master key is not 32 bytes of hex.
    #[error("Invalid master key: {0}")]
    InvalidKey(String),

    /// Failed to access keyring.
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

impl CryptoError {
    /// Returns an owned copy; keyring failures are carried as text.
    #[must_use]
    pub fn replicate(&self) -> Self {
        match self {
            Self::Format(msg) => Self::Format(msg.clone()),
            Self::Authentication => Self::Authentication,
            Self::Encryption => Self::Encryption,
            Self::InvalidKey(msg) => Self::InvalidKey(msg.clone()),
            Self::Keyring(err) => {
                Self::Keyring(keyring::Error::PlatformFailure(err.to_string().into()))
            }
        }
    }
}

/// Result type for credential encryption.
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// 256-bit master key for credential envelopes.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses a 64 character hex key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the value is not 32 bytes of hex.
    pub fn from_hex(value: &str) -> CryptoResult<Self> {
        let bytes =
            hex::decode(value.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            CryptoError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Hex encoding of the key, for provisioning.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Loads the master key from the system keyring.
    ///
    /// # Errors
    ///
    /// Returns an error if the keyring operation fails or the stored value is not a key.
    pub fn load_from_keyring() -> CryptoResult<Option<Self>> {
        let entry = Entry::new(SERVICE_NAME, MASTER_KEY_ENTRY)?;
        match entry.get_password() {
            Ok(value) => Self::from_hex(&value).map(Some),
            Err(keyring::Error::NoEntry) => {
                debug!("No master key found in keyring");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stores the master key in the system keyring.
    ///
    /// # Errors
    ///
    /// Returns an error if the keyring operation fails.
    pub fn store_in_keyring(&self) -> CryptoResult<()> {
        let entry = Entry::new(SERVICE_NAME, MASTER_KEY_ENTRY)?;
        entry.set_password(&self.to_hex())?;
        debug!("Stored master key in keyring");
        Ok(())
    }

    /// Removes the master key from the system keyring.
    ///
    /// # Errors
    ///
    /// Returns an error if the keyring operation fails (except for missing entries).
    pub fn delete_from_keyring() -> CryptoResult<()> {
        let entry = Entry::new(SERVICE_NAME, MASTER_KEY_ENTRY)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Parsed credential envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    nonce: [u8; NONCE_LEN],
    tag: [u8; TAG_LEN],
    ciphertext: Vec<u8>,
}

impl Envelope {
    /// Returns true if `value` is already a well-formed envelope.
    #[must_use]
    pub fn is_envelope(value: &str) -> bool {
        value.parse::<Self>().is_ok()
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEGMENT_SEPARATOR}{}{SEGMENT_SEPARATOR}{}",
            hex::encode(self.nonce),
            hex::encode(self.tag),
            hex::encode(&self.ciphertext)
        )
    }
}

impl FromStr for Envelope {
    type Err = CryptoError;

    fn from_str(s: &str) -> CryptoResult<Self> {
        let mut parts = s.split(SEGMENT_SEPARATOR);
        let (Some(nonce), Some(tag), Some(ciphertext), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CryptoError::Format("expected three segments".into()));
        };

        let nonce = decode_fixed::<NONCE_LEN>(nonce, "nonce")?;
        let tag = decode_fixed::<TAG_LEN>(tag, "tag")?;
        let ciphertext =
            hex::decode(ciphertext).map_err(|e| CryptoError::Format(format!("ciphertext: {e}")))?;

        Ok(Self {
            nonce,
            tag,
            ciphertext,
        })
    }
}

fn decode_fixed<const N: usize>(segment: &str, label: &str) -> CryptoResult<[u8; N]> {
    let bytes = hex::decode(segment).map_err(|e| CryptoError::Format(format!("{label}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::Format(format!("{label}: expected {N} bytes")))
}

/// Encrypts and decrypts secrets bound to an account identity.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Creates a cipher using the given master key.
    #[must_use]
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::<Aes256Gcm>::from(key.0);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Seals `plaintext` for the record `record_id`.
    ///
    /// A value that is already an envelope is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if the cipher fails.
    pub fn encrypt(&self, record_id: &AccountId, plaintext: &str) -> CryptoResult<String> {
        if Envelope::is_envelope(plaintext) {
            debug!(account_id = %record_id, "Value is already sealed, skipping encryption");
            return Ok(plaintext.to_string());
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let aad = record_id.to_string();
        let mut sealed = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Encryption)?;

        // aes-gcm appends the tag to the ciphertext
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        let envelope = Envelope {
            nonce: nonce.as_slice().try_into().map_err(|_| CryptoError::Encryption)?,
            tag: tag.try_into().map_err(|_| CryptoError::Encryption)?,
            ciphertext: sealed,
        };
        Ok(envelope.to_string())
    }

    /// Opens an envelope sealed for `record_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Format`] for a malformed envelope and
    /// [`CryptoError::Authentication`] if the key, record binding or data do not match.
    pub fn decrypt(&self, record_id: &AccountId, envelope: &str) -> CryptoResult<String> {
        let envelope: Envelope = envelope.parse()?;
        let aad = record_id.to_string();

        let mut sealed = envelope.ciphertext;
        sealed.extend_from_slice(&envelope.tag);

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                Payload {
                    msg: &sealed,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Authentication)?;

        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Format("plaintext is not UTF-8".into()))
    }
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn cipher() -> CredentialCipher {
        CredentialCipher::new(&EncryptionKey::from_bytes([7u8; KEY_LEN]))
    }

    #[test]
    fn envelope_layout() {
        let id = AccountId::generate();
        let sealed = cipher().encrypt(&id, "hunter2").unwrap();
        let segments: Vec<&str> = sealed.split(':').collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].len(), NONCE_LEN * 2);
        assert_eq!(segments[1].len(), TAG_LEN * 2);
        assert_eq!(segments[2].len(), "hunter2".len() * 2);
        assert_eq!(sealed.parse::<Envelope>().unwrap().to_string(), sealed);
    }

    #[test]
    fn nonces_are_fresh() {
        let id = AccountId::generate();
        let c = cipher();
        assert_ne!(c.encrypt(&id, "same").unwrap(), c.encrypt(&id, "same").unwrap());
    }

    #[test]
    fn envelope_from_another_record_is_rejected() {
        let c = cipher();
        let sealed = c.encrypt(&AccountId::generate(), "refresh-token").unwrap();
        let err = c.decrypt(&AccountId::generate(), &sealed).unwrap_err();
        assert!(matches!(err, CryptoError::Authentication));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let id = AccountId::generate();
        let sealed = cipher().encrypt(&id, "secret").unwrap();
        let other = CredentialCipher::new(&EncryptionKey::from_bytes([8u8; KEY_LEN]));
        assert!(matches!(other.decrypt(&id, &sealed), Err(CryptoError::Authentication)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let id = AccountId::generate();
        let c = cipher();
        let sealed = c.encrypt(&id, "secret").unwrap();
        let (head, last) = sealed.split_at(sealed.len() - 1);
        let flipped = if last == "0" { "1" } else { "0" };
        let tampered = format!("{head}{flipped}");
        assert!(matches!(c.decrypt(&id, &tampered), Err(CryptoError::Authentication)));
    }

    #[test]
    fn malformed_envelopes() {
        let id = AccountId::generate();
        let c = cipher();
        for bad in ["", "plain", "aa:bb", "zz:zz:zz", "00:00:00:00"] {
            assert!(matches!(c.decrypt(&id, bad), Err(CryptoError::Format(_))), "{bad}");
        }
    }

    #[test]
    fn sealing_is_idempotent() {
        let id = AccountId::generate();
        let c = cipher();
        let sealed = c.encrypt(&id, "secret").unwrap();
        let resealed = c.encrypt(&id, &sealed).unwrap();
        assert_eq!(sealed, resealed);
        assert_eq!(c.decrypt(&id, &resealed).unwrap(), "secret");
    }

    #[test]
    fn key_hex_round_trip_and_redaction() {
        let key = EncryptionKey::generate();
        assert_eq!(EncryptionKey::from_hex(&key.to_hex()).unwrap(), key);
        assert!(!format!("{key:?}").contains(&key.to_hex()));
        assert!(matches!(EncryptionKey::from_hex("abcd"), Err(CryptoError::InvalidKey(_))));
        assert!(matches!(EncryptionKey::from_hex("not hex"), Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    #[ignore = "Interacts with system keyring"]
    fn keyring_round_trip() {
        let key = EncryptionKey::generate();
        key.store_in_keyring().unwrap();
        assert_eq!(EncryptionKey::load_from_keyring().unwrap(), Some(key));
        EncryptionKey::delete_from_keyring().unwrap();
        assert_eq!(EncryptionKey::load_from_keyring().unwrap(), None);
    }

    proptest! {
        #[test]
        fn decrypt_inverts_encrypt(secret in "[^:]{0,64}") {
            let id = AccountId::generate();
            let c = cipher();
            let sealed = c.encrypt(&id, &secret).unwrap();
            prop_assert_eq!(c.decrypt(&id, &sealed).unwrap(), secret);
            prop_assert!(c.decrypt(&AccountId::generate(), &sealed).is_err());
        }
    }
}

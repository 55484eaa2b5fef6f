// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use rand::{distributions::Alphanumeric, thread_rng, Rng, RngCore};
use sha2::Sha512;
use thiserror::Error;
use vodozemac::{
    pk_encryption::{Message, PkDecryption},
    Curve25519PublicKey, Curve25519SecretKey,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{BackupEncryptionKey, DecryptionError};
use crate::{
    crypto::BackupCrypto,
    types::{
        BackedUpRoomKey, EncryptedSessionData, KeyBackupData, MegolmV1AuthData, RoomKeySession,
    },
};

/// Error type for the decoding of a recovery key.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The recovery key has an invalid prefix.
    #[error("The decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte of the recovery key didn't match.
    #[error("The parity byte of the recovery key doesn't match: expected {0:?}, got {1:?}")]
    Parity(u8, u8),
    /// The recovery key has an invalid length.
    #[error("The decoded recovery key has a invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The recovery key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
}

/// The private half of a backup key.
///
/// The key is zeroized when dropped and is never printed by its [`Debug`]
/// implementation.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct BackupDecryptionKey {
    inner: Box<[u8; BackupDecryptionKey::KEY_SIZE]>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for BackupDecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BackupDecryptionKey").field(&"...").finish()
    }
}

impl std::fmt::Display for BackupDecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = Zeroizing::new(self.to_base58());

        let string = Zeroizing::new(
            string
                .chars()
                .collect::<Vec<char>>()
                .chunks(Self::DISPLAY_CHUNK_SIZE)
                .map(|c| c.iter().collect::<String>())
                .collect::<Vec<_>>()
                .join(" "),
        );

        f.write_str(&string)
    }
}

impl BackupDecryptionKey {
    /// The number of bytes the decryption key has.
    pub const KEY_SIZE: usize = 32;

    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const DISPLAY_CHUNK_SIZE: usize = 4;
    const ENCODED_SIZE: usize = Self::PREFIX.len() + Self::KEY_SIZE + 1;
    const SALT_SIZE: usize = 32;

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }

    /// Create a new random decryption key.
    pub fn new() -> Self {
        let mut inner = Box::new([0u8; Self::KEY_SIZE]);
        thread_rng().fill_bytes(inner.as_mut_slice());

        Self { inner }
    }

    /// Create a decryption key from the raw bytes of a Curve25519 private key.
    pub fn from_bytes(bytes: &[u8; Self::KEY_SIZE]) -> Self {
        Self { inner: Box::new(*bytes) }
    }

    /// Derive a decryption key from a passphrase, see [`Self::generate_salt`].
    ///
    /// This runs PBKDF2-HMAC-SHA-512 for the given number of rounds, callers
    /// should keep it off any latency sensitive thread.
    pub fn from_passphrase(passphrase: &str, salt: &str, iterations: u32) -> Self {
        let mut inner = Box::new([0u8; Self::KEY_SIZE]);
        pbkdf2::pbkdf2_hmac::<Sha512>(
            passphrase.as_bytes(),
            salt.as_bytes(),
            iterations,
            inner.as_mut_slice(),
        );

        Self { inner }
    }

    /// Generate a random salt for [`Self::from_passphrase`].
    pub fn generate_salt() -> String {
        thread_rng().sample_iter(&Alphanumeric).take(Self::SALT_SIZE).map(char::from).collect()
    }

    /// Try to decode a recovery key.
    ///
    /// Whitespace is ignored, so both the grouped display form and the plain
    /// base58 form are accepted.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        let value: Zeroizing<String> =
            Zeroizing::new(value.chars().filter(|c| !c.is_whitespace()).collect());

        let decoded = Zeroizing::new(
            bs58::decode(value.as_str()).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?,
        );

        if decoded.len() != Self::ENCODED_SIZE {
            return Err(DecodeError::Length(Self::ENCODED_SIZE, decoded.len()));
        }

        let (prefix, rest) = decoded.split_at(Self::PREFIX.len());
        let (key, expected_parity) = rest.split_at(Self::KEY_SIZE);

        let prefix = [prefix[0], prefix[1]];
        let expected_parity = expected_parity[0];
        let parity = Self::parity_byte(key);

        if prefix != Self::PREFIX {
            Err(DecodeError::Prefix(Self::PREFIX, prefix))
        } else if expected_parity != parity {
            Err(DecodeError::Parity(expected_parity, parity))
        } else {
            let mut inner = Box::new([0u8; Self::KEY_SIZE]);
            inner.copy_from_slice(key);

            Ok(Self { inner })
        }
    }

    /// Encode the key as a base58 recovery key, without any whitespace.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_ref(),
                self.inner.as_ref(),
                [Self::parity_byte(self.inner.as_ref())].as_ref(),
            ]
            .concat(),
        );

        bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string()
    }

    /// Get the raw bytes of the key.
    pub fn as_bytes(&self) -> &[u8; Self::KEY_SIZE] {
        &self.inner
    }

    fn pk_decryption(&self) -> PkDecryption {
        PkDecryption::from_key(Curve25519SecretKey::from_slice(&self.inner))
    }

    /// The Curve25519 public key matching this decryption key.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.pk_decryption().public_key()
    }

    /// The encryption key matching this decryption key.
    pub fn encryption_key(&self) -> BackupEncryptionKey {
        BackupEncryptionKey::new(self.public_key())
    }

    /// Does this key belong to the backup the given auth data describes.
    pub fn backup_key_matches(&self, auth_data: &MegolmV1AuthData) -> bool {
        self.public_key() == auth_data.public_key
    }

    /// Decrypt the encrypted part of a backup entry.
    pub fn decrypt(
        &self,
        data: &EncryptedSessionData,
    ) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
        let message = Message {
            ciphertext: vodozemac::base64_decode(&data.ciphertext)?,
            mac: vodozemac::base64_decode(&data.mac)?,
            ephemeral_key: Curve25519PublicKey::from_base64(&data.ephemeral)?,
        };

        Ok(Zeroizing::new(self.pk_decryption().decrypt(&message)?))
    }

    /// Decrypt a backup entry using the given [`BackupCrypto`] and rebuild
    /// the room key it contains.
    pub fn decrypt_room_key(
        &self,
        crypto: &dyn BackupCrypto,
        room_id: &ruma::RoomId,
        session_id: &str,
        entry: &KeyBackupData,
    ) -> Result<RoomKeySession, DecryptionError> {
        let plaintext = crypto.decrypt(self, &entry.session_data)?;
        let key: BackedUpRoomKey = serde_json::from_slice(&plaintext)?;

        Ok(RoomKeySession::from_backed_up_key(
            room_id.to_owned(),
            session_id.to_owned(),
            key,
            entry,
        ))
    }
}

impl Default for BackupDecryptionKey {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use super::{BackupDecryptionKey, DecodeError};

    const TEST_KEY: [u8; 32] = [
        0x77, 0x07, 0x6D, 0x0A, 0x73, 0x18, 0xA5, 0x7D, 0x3C, 0x16, 0xC1, 0x72, 0x51, 0xB2, 0x66,
        0x45, 0xDF, 0x4C, 0x2F, 0x87, 0xEB, 0xC0, 0x99, 0x2A, 0xB1, 0x77, 0xFB, 0xA5, 0x1D, 0xB9,
        0x2C, 0x2A,
    ];

    #[test]
    fn base58_encoding() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);
        let encoded = key.to_base58();

        let decoded = BackupDecryptionKey::from_base58(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), &TEST_KEY);

        let display = key.to_string();
        assert!(display.split(' ').all(|chunk| chunk.len() <= 4));

        let decoded = BackupDecryptionKey::from_base58(&display).unwrap();
        assert_eq!(decoded.as_bytes(), &TEST_KEY);
    }

    #[test]
    fn invalid_recovery_keys() {
        assert_matches!(
            BackupDecryptionKey::from_base58("not base58 0OIl"),
            Err(DecodeError::Base58(_))
        );

        let short = bs58::encode([0x8b, 0x01, 0x00]).into_string();
        assert_matches!(BackupDecryptionKey::from_base58(&short), Err(DecodeError::Length(35, 3)));

        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);
        let mut bytes = bs58::decode(key.to_base58()).into_vec().unwrap();

        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let wrong_parity = bs58::encode(&bytes).into_string();
        assert_matches!(
            BackupDecryptionKey::from_base58(&wrong_parity),
            Err(DecodeError::Parity(..))
        );

        bytes[last] ^= 0xff;
        bytes[0] = 0x8c;
        let wrong_prefix = bs58::encode(&bytes).into_string();
        assert_matches!(
            BackupDecryptionKey::from_base58(&wrong_prefix),
            Err(DecodeError::Prefix([0x8b, 0x01], [0x8c, 0x01]))
        );
    }

    #[test]
    fn passphrase_derivation_is_deterministic() {
        let salt = BackupDecryptionKey::generate_salt();
        assert_eq!(salt.len(), 32);

        let first = BackupDecryptionKey::from_passphrase("it's a secret", &salt, 1000);
        let second = BackupDecryptionKey::from_passphrase("it's a secret", &salt, 1000);
        let other = BackupDecryptionKey::from_passphrase("another secret", &salt, 1000);

        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(first.public_key(), second.public_key());
        assert_ne!(first.public_key(), other.public_key());
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);
        let debug = format!("{key:?}");

        assert!(!debug.contains(&key.to_base58()));
        assert_eq!(debug, r#"BackupDecryptionKey("...")"#);
    }

    proptest! {
        #[test]
        fn decoding_never_panics(input in "\\PC*") {
            let _ = BackupDecryptionKey::from_base58(&input);
        }
    }
}

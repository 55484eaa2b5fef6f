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

use vodozemac::{Curve25519PublicKey, KeyError};
use zeroize::Zeroizing;

use crate::{
    crypto::BackupCrypto,
    types::{BackedUpRoomKey, KeyBackupData, MegolmV1AuthData, RoomKeySession},
};

/// The public part of a backup key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BackupEncryptionKey {
    key: Curve25519PublicKey,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for BackupEncryptionKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("BackupEncryptionKey").field("key", &self.to_base64()).finish()
    }
}

impl BackupEncryptionKey {
    pub(crate) fn new(key: Curve25519PublicKey) -> Self {
        Self { key }
    }

    /// Get the encryption key a backup version publishes in its auth data.
    pub fn from_auth_data(auth_data: &MegolmV1AuthData) -> Self {
        Self::new(auth_data.public_key)
    }

    /// Try to create a new `BackupEncryptionKey` from a base 64 encoded
    /// string.
    pub fn from_base64(public_key: &str) -> Result<Self, KeyError> {
        Ok(Self::new(Curve25519PublicKey::from_base64(public_key)?))
    }

    /// Convert the [`BackupEncryptionKey`] to a base 64 encoded string.
    pub fn to_base64(&self) -> String {
        self.key.to_base64()
    }

    /// The underlying Curve25519 public key.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.key
    }

    /// Encrypt a room key so it can be uploaded to the backup.
    ///
    /// The key material and the sender information get encrypted, the
    /// message index, forwarding count and verification state are stored next
    /// to the ciphertext in the clear.
    pub fn encrypt(
        &self,
        crypto: &dyn BackupCrypto,
        session: &RoomKeySession,
    ) -> Result<KeyBackupData, serde_json::Error> {
        let key = BackedUpRoomKey::from(session);
        let plaintext = Zeroizing::new(serde_json::to_vec(&key)?);

        Ok(KeyBackupData {
            first_message_index: session.first_known_index,
            forwarded_count: session.forwarded_count,
            is_verified: session.verified,
            session_data: crypto.encrypt(&self.key, &plaintext),
        })
    }
}

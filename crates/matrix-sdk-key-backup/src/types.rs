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

//! The data types that are exchanged with the backup service and the local key
//! store.

use std::collections::BTreeMap;

use ruma::{CanonicalJsonValue, OwnedRoomId, OwnedUserId, UserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ProtocolError;

/// The identifier of the only backup algorithm this crate can encrypt for.
pub const MEGOLM_BACKUP_V1: &str = "m.megolm_backup.v1.curve25519-aes-sha2";

/// The identifier of the megolm room key algorithm.
pub const MEGOLM_V1_AES_SHA2: &str = "m.megolm.v1.aes-sha2";

fn deserialize_curve_key<'de, D>(de: D) -> Result<Curve25519PublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

fn serialize_curve_key<S>(key: &Curve25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&key.to_base64())
}

/// Signatures of a JSON object, keyed by user id and then by key id, e.g.
/// `ed25519:DEVICEID`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signatures(BTreeMap<OwnedUserId, BTreeMap<String, String>>);

impl Signatures {
    /// Add a base64 encoded signature made by the key with the given id.
    pub fn add_signature(&mut self, user_id: OwnedUserId, key_id: String, signature: String) {
        self.0.entry(user_id).or_default().insert(key_id, signature);
    }

    /// Get the signature the given user made with the key with the given id.
    pub fn get_signature(&self, user_id: &UserId, key_id: &str) -> Option<&str> {
        self.0.get(user_id)?.get(key_id).map(String::as_str)
    }
}

/// Auth data for the `m.megolm_backup.v1.curve25519-aes-sha2` backup
/// algorithm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MegolmV1AuthData {
    /// The Curve25519 public key used to encrypt the backups.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub public_key: Curve25519PublicKey,
    /// The salt that was used to derive the private key from a passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_salt: Option<String>,
    /// The number of PBKDF2 rounds that were used to derive the private key
    /// from a passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_iterations: Option<u32>,
    /// Signatures of the auth_data, as Signed JSON.
    #[serde(default)]
    pub signatures: Signatures,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl MegolmV1AuthData {
    /// Create new, unsigned, auth data for the given public key.
    pub fn new(public_key: Curve25519PublicKey) -> Self {
        Self {
            public_key,
            private_key_salt: None,
            private_key_iterations: None,
            signatures: Default::default(),
            extra: Default::default(),
        }
    }

    /// The salt and iteration count, if the private key was derived from a
    /// passphrase.
    pub fn passphrase_info(&self) -> Option<(&str, u32)> {
        Some((self.private_key_salt.as_deref()?, self.private_key_iterations?))
    }

    /// The canonical JSON form of the auth data that signatures are made over.
    ///
    /// The `signatures` and `unsigned` fields are not part of it.
    pub fn to_signable_json(&self) -> Result<String, ProtocolError> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| ProtocolError::CanonicalJson(e.to_string()))?;

        if let Some(object) = value.as_object_mut() {
            object.remove("signatures");
            object.remove("unsigned");
        }

        let canonical = CanonicalJsonValue::try_from(value)
            .map_err(|e| ProtocolError::CanonicalJson(e.to_string()))?;

        Ok(canonical.to_string())
    }
}

/// Information pertaining to a room key backup. Used to create a new backup
/// version.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "BackupInfoHelper")]
pub enum RoomKeyBackupInfo {
    /// The `m.megolm_backup.v1.curve25519-aes-sha2` variant of a backup.
    MegolmBackupV1Curve25519AesSha2(MegolmV1AuthData),
    /// Any other unknown backup variant.
    Other {
        /// The algorithm of the unknown backup variant.
        algorithm: String,
        /// The auth data of the unknown backup variant.
        auth_data: BTreeMap<String, Value>,
    },
}

impl RoomKeyBackupInfo {
    /// The identifier of the backup algorithm.
    pub fn algorithm(&self) -> &str {
        match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(_) => MEGOLM_BACKUP_V1,
            RoomKeyBackupInfo::Other { algorithm, .. } => algorithm,
        }
    }

    /// The megolm v1 auth data, fails if the backup uses some other algorithm.
    pub fn megolm_v1_auth_data(&self) -> Result<&MegolmV1AuthData, ProtocolError> {
        match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) => Ok(auth_data),
            RoomKeyBackupInfo::Other { algorithm, .. } => {
                Err(ProtocolError::UnsupportedAlgorithm(algorithm.to_owned()))
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BackupInfoHelper {
    algorithm: String,
    auth_data: Value,
}

impl TryFrom<BackupInfoHelper> for RoomKeyBackupInfo {
    type Error = serde_json::Error;

    fn try_from(value: BackupInfoHelper) -> Result<Self, Self::Error> {
        Ok(match value.algorithm.as_str() {
            MEGOLM_BACKUP_V1 => {
                RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(serde_json::from_value(
                    value.auth_data,
                )?)
            }
            _ => RoomKeyBackupInfo::Other {
                algorithm: value.algorithm,
                auth_data: serde_json::from_value(value.auth_data)?,
            },
        })
    }
}

impl Serialize for RoomKeyBackupInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let auth_data = match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(d) => serde_json::to_value(d),
            RoomKeyBackupInfo::Other { auth_data, .. } => serde_json::to_value(auth_data),
        }
        .map_err(serde::ser::Error::custom)?;

        BackupInfoHelper { algorithm: self.algorithm().to_owned(), auth_data }
            .serialize(serializer)
    }
}

/// A backup version as it exists on the backup service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupVersionInfo {
    /// The opaque version identifier the service assigned.
    pub version: String,
    /// The algorithm and auth data of the backup.
    #[serde(flatten)]
    pub info: RoomKeyBackupInfo,
    /// The number of keys stored in the backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// An opaque string that changes whenever the stored keys change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl BackupVersionInfo {
    /// Create a descriptor for a freshly created version.
    pub fn new(version: String, info: RoomKeyBackupInfo) -> Self {
        Self { version, info, count: None, etag: None }
    }

    /// The identifier of the backup algorithm.
    pub fn algorithm(&self) -> &str {
        self.info.algorithm()
    }
}

/// The exported key material of a megolm session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct ExportedSessionKey(String);

impl ExportedSessionKey {
    /// Get the session key as a base64 string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ExportedSessionKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for ExportedSessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExportedSessionKey(...)")
    }
}

/// A room key as it is held in the local key store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeySession {
    /// The encryption algorithm the session uses.
    pub algorithm: String,
    /// The room where the session is used.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device which initiated the session.
    pub sender_key: String,
    /// The ID of the session.
    pub session_id: String,
    /// The key material of the session.
    pub session_key: ExportedSessionKey,
    /// The keys the sender of the session claims to own.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// Chain of Curve25519 keys through which this session was forwarded.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
    /// The first message index the key material can decrypt.
    pub first_known_index: u32,
    /// How many times the session was forwarded before it reached us.
    #[serde(default)]
    pub forwarded_count: u32,
    /// Was the device that sent us the session verified.
    #[serde(default)]
    pub verified: bool,
}

/// The plaintext of an encrypted backup entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackedUpRoomKey {
    /// The encryption algorithm the session uses.
    pub algorithm: String,
    /// The Curve25519 key of the device which initiated the session.
    pub sender_key: String,
    /// The key material of the session.
    pub session_key: ExportedSessionKey,
    /// The keys the sender of the session claims to own.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// Chain of Curve25519 keys through which this session was forwarded.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl From<&RoomKeySession> for BackedUpRoomKey {
    fn from(session: &RoomKeySession) -> Self {
        Self {
            algorithm: session.algorithm.clone(),
            sender_key: session.sender_key.clone(),
            session_key: session.session_key.clone(),
            sender_claimed_keys: session.sender_claimed_keys.clone(),
            forwarding_curve25519_key_chain: session.forwarding_curve25519_key_chain.clone(),
        }
    }
}

impl RoomKeySession {
    /// Rebuild a session from a decrypted backup entry.
    ///
    /// The room and session ids are the keys the entry was stored under, the
    /// metadata is taken from the unencrypted part of the entry.
    pub fn from_backed_up_key(
        room_id: OwnedRoomId,
        session_id: String,
        key: BackedUpRoomKey,
        metadata: &KeyBackupData,
    ) -> Self {
        Self {
            algorithm: key.algorithm,
            room_id,
            sender_key: key.sender_key,
            session_id,
            session_key: key.session_key,
            sender_claimed_keys: key.sender_claimed_keys,
            forwarding_curve25519_key_chain: key.forwarding_curve25519_key_chain,
            first_known_index: metadata.first_message_index,
            forwarded_count: metadata.forwarded_count,
            verified: metadata.is_verified,
        }
    }
}

/// The encrypted part of a backup entry, all fields are unpadded base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// The ephemeral Curve25519 key the entry was encrypted with.
    pub ephemeral: String,
    /// The ciphertext of the entry.
    pub ciphertext: String,
    /// The MAC of the ciphertext.
    pub mac: String,
}

/// A single encrypted room key in the backup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The index of the first message in the session that the key can decrypt.
    pub first_message_index: u32,
    /// The number of times this key has been forwarded.
    pub forwarded_count: u32,
    /// Whether the device backing up the key verified the device that the key
    /// is from.
    pub is_verified: bool,
    /// The encrypted room key.
    pub session_data: EncryptedSessionData,
}

/// All the backed up keys of a single room, keyed by session id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyBackup {
    /// The encrypted room keys, keyed by session id.
    pub sessions: BTreeMap<String, KeyBackupData>,
}

/// A set of backed up room keys, keyed by room id.
pub type BackupBlob = BTreeMap<OwnedRoomId, RoomKeyBackup>;

/// Room key counts of the local key store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// The total number of room keys.
    pub total: usize,
    /// The number of backed up room keys.
    pub backed_up: usize,
}

impl RoomKeyCounts {
    /// Are all the room keys backed up.
    pub fn is_complete(&self) -> bool {
        self.backed_up >= self.total
    }
}

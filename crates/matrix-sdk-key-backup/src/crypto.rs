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

//! The cryptographic capabilities the backup depends on.
//!
//! [`BackupCrypto`] encrypts and decrypts room keys of the backup and
//! [`DeviceSigner`]
//! signs the auth data of new backup versions with the identity key of the
//! device. Both have a default implementation backed by `vodozemac`.

use std::fmt::Debug;

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use thiserror::Error;
use tracing::debug;
use vodozemac::{
    pk_encryption::PkEncryption, Curve25519PublicKey, Ed25519Keypair, Ed25519PublicKey,
    Ed25519Signature,
};

use zeroize::Zeroizing;

use crate::{
    error::ProtocolError,
    keys::{BackupDecryptionKey, DecryptionError},
    types::{EncryptedSessionData, MegolmV1AuthData},
};

/// Error type signaling that key generation or signing isn't possible.
#[derive(Debug, Error)]
#[error("the crypto backend is unavailable: {0}")]
pub struct CryptoUnavailable(pub String);

/// Encryption primitives of the `m.megolm_backup.v1.curve25519-aes-sha2`
/// backup algorithm.
pub trait BackupCrypto: Debug + Send + Sync {
    /// Generate a new backup key pair.
    fn generate_decryption_key(&self) -> Result<BackupDecryptionKey, CryptoUnavailable>;

    /// Encrypt the given plaintext for the given public key.
    fn encrypt(&self, public_key: &Curve25519PublicKey, plaintext: &[u8]) -> EncryptedSessionData;

    /// Decrypt a backup entry with the private key of the backup, the MAC is
    /// checked before anything gets decrypted.
    fn decrypt(
        &self,
        key: &BackupDecryptionKey,
        data: &EncryptedSessionData,
    ) -> Result<Zeroizing<Vec<u8>>, DecryptionError>;
}

/// The default [`BackupCrypto`], using `vodozemac`'s PkEncryption.
#[derive(Clone, Copy, Debug, Default)]
pub struct Curve25519AesSha2;

impl BackupCrypto for Curve25519AesSha2 {
    fn generate_decryption_key(&self) -> Result<BackupDecryptionKey, CryptoUnavailable> {
        Ok(BackupDecryptionKey::new())
    }

    fn encrypt(&self, public_key: &Curve25519PublicKey, plaintext: &[u8]) -> EncryptedSessionData {
        let message = PkEncryption::from_key(*public_key).encrypt(plaintext);

        EncryptedSessionData {
            ephemeral: message.ephemeral_key.to_base64(),
            ciphertext: vodozemac::base64_encode(message.ciphertext),
            mac: vodozemac::base64_encode(message.mac),
        }
    }

    fn decrypt(
        &self,
        key: &BackupDecryptionKey,
        data: &EncryptedSessionData,
    ) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
        key.decrypt(data)
    }
}

/// The identity of the device that creates and trusts backup versions.
pub trait DeviceSigner: Debug + Send + Sync {
    /// The user the device belongs to.
    fn user_id(&self) -> &UserId;

    /// The ID of the device.
    fn device_id(&self) -> &DeviceId;

    /// The Ed25519 identity key of the device.
    fn ed25519_key(&self) -> Ed25519PublicKey;

    /// Sign the given message with the Ed25519 identity key.
    fn sign(&self, message: &str) -> Result<Ed25519Signature, CryptoUnavailable>;

    /// The key id signatures of this device are stored under.
    fn key_id(&self) -> String {
        format!("ed25519:{}", self.device_id())
    }
}

/// A [`DeviceSigner`] holding an Ed25519 key pair in memory.
pub struct DeviceIdentity {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    signing_key: Ed25519Keypair,
}

#[cfg(not(tarpaulin_include))]
impl Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("ed25519_key", &self.signing_key.public_key())
            .finish()
    }
}

impl DeviceIdentity {
    /// Create a device identity with a freshly generated signing key.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            signing_key: Ed25519Keypair::new(),
        }
    }
}

impl DeviceSigner for DeviceIdentity {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn ed25519_key(&self) -> Ed25519PublicKey {
        self.signing_key.public_key()
    }

    fn sign(&self, message: &str) -> Result<Ed25519Signature, CryptoUnavailable> {
        Ok(self.signing_key.sign(message.as_bytes()))
    }
}

/// The result of a signature check of a backup version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureState {
    /// The backup isn't signed by our device.
    Missing,
    /// Our device signed the backup but the signature doesn't verify.
    Invalid,
    /// Our device signed the backup and the signature is valid.
    ValidAndTrusted,
}

impl SignatureState {
    /// Is the state considered to be trusted.
    pub fn trusted(self) -> bool {
        self == SignatureState::ValidAndTrusted
    }
}

/// Sign the auth data of a new backup version with the identity key of the
/// device.
pub(crate) fn sign_auth_data(
    signer: &dyn DeviceSigner,
    auth_data: &mut MegolmV1AuthData,
) -> Result<(), crate::KeyBackupError> {
    let signable = auth_data.to_signable_json()?;
    let signature = signer.sign(&signable)?;

    auth_data.signatures.add_signature(
        signer.user_id().to_owned(),
        signer.key_id(),
        signature.to_base64(),
    );

    Ok(())
}

/// Check if the auth data was signed by the identity key of the device.
pub(crate) fn verify_auth_data(
    signer: &dyn DeviceSigner,
    auth_data: &MegolmV1AuthData,
) -> Result<SignatureState, ProtocolError> {
    let Some(signature) = auth_data.signatures.get_signature(signer.user_id(), &signer.key_id())
    else {
        return Ok(SignatureState::Missing);
    };

    let Ok(signature) = Ed25519Signature::from_base64(signature) else {
        debug!("The backup signature of our device isn't valid base64");
        return Ok(SignatureState::Invalid);
    };

    let signable = auth_data.to_signable_json()?;

    Ok(match signer.ed25519_key().verify(signable.as_bytes(), &signature) {
        Ok(()) => SignatureState::ValidAndTrusted,
        Err(_) => SignatureState::Invalid,
    })
}

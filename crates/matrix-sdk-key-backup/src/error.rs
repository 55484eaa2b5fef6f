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

use thiserror::Error;

use crate::{
    crypto::CryptoUnavailable,
    keys::DecodeError,
    service::{ErrorKind, ServiceError},
    store::CryptoStoreError,
};

/// Error type for the key backup operations.
#[derive(Debug, Error)]
pub enum KeyBackupError {
    /// The backup service couldn't be reached.
    #[error("the backup service couldn't be reached: {0}")]
    Network(String),

    /// The backup service responded with an error.
    #[error("the backup service responded with an error: {0}")]
    Server(ErrorKind),

    /// The recovery key couldn't be decoded or doesn't belong to the backup.
    #[error("invalid recovery key: {0}")]
    InvalidRecoveryKey(#[from] RecoveryKeyError),

    /// The backup or one of its entries isn't in a format we understand.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Key generation or signing failed.
    #[error(transparent)]
    CryptoUnavailable(#[from] CryptoUnavailable),

    /// The operation isn't allowed in the current state of the backup.
    #[error("the operation isn't allowed in the current backup state: {0}")]
    InvariantViolation(&'static str),

    /// The local key store failed.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// A room key couldn't be serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl KeyBackupError {
    /// The error kind if the backup service responded with an error.
    pub fn server_error_kind(&self) -> Option<&ErrorKind> {
        match self {
            KeyBackupError::Server(kind) => Some(kind),
            _ => None,
        }
    }
}

impl From<ServiceError> for KeyBackupError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Network(message) => KeyBackupError::Network(message),
            ServiceError::Server(kind) => KeyBackupError::Server(kind),
        }
    }
}

/// Error type describing why a recovery key was rejected.
#[derive(Debug, Error)]
pub enum RecoveryKeyError {
    /// The recovery key string isn't valid.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The recovery key doesn't belong to the public key of the backup.
    #[error("the recovery key doesn't match the public key of the backup version")]
    KeyMismatch,
}

/// Error type for backups we can't make sense of.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The backup uses an algorithm we don't support.
    #[error("unsupported backup algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// The key of the backup wasn't derived from a passphrase.
    #[error("the backup auth data doesn't contain a passphrase salt and iteration count")]
    MissingPassphraseInfo,

    /// The auth data couldn't be converted to canonical JSON.
    #[error("the backup auth data can't be converted to canonical JSON: {0}")]
    CanonicalJson(String),
}

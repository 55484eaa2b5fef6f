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

//! The two halves of a backup key.
//!
//! The [`BackupEncryptionKey`] is the public Curve25519 key every room key gets
//! encrypted for before it is uploaded, it is published in the auth data of
//! the backup version. The [`BackupDecryptionKey`] is the matching private key,
//! it never leaves the device in plaintext and is shown to the user as a
//! recovery key.

mod backup;
mod recovery;

use thiserror::Error;

pub use backup::BackupEncryptionKey;
pub use recovery::{BackupDecryptionKey, DecodeError};

/// Error type for the decryption of a single backed up room key.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// One of the fields of the encrypted session data isn't valid base64.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    /// The ephemeral key isn't a valid Curve25519 key.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// The MAC didn't match or the ciphertext is otherwise corrupted.
    #[error(transparent)]
    Decryption(#[from] vodozemac::pk_encryption::Error),

    /// The plaintext isn't a backed up room key.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

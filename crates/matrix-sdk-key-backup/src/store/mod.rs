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

//! The local side of the backup.
//!
//! The [`KeyBackupStore`] holds the decrypted room keys of the device together
//! with a marker telling if a key was already uploaded to the current backup
//! version.

mod memorystore;

use std::fmt::Debug;

use async_trait::async_trait;
use ruma::RoomId;
use thiserror::Error;

pub use memorystore::MemoryStore;

use crate::types::{RoomKeyCounts, RoomKeySession};

/// A `KeyBackupStore` specific result type.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// The crypto store's error type.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// A room key couldn't be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A problem with the underlying database backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl CryptoStoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// The storage the backup reads room keys from and imports restored keys
/// into.
#[async_trait]
pub trait KeyBackupStore: Debug + Send + Sync {
    /// The number of room keys, and how many of them are backed up.
    async fn room_key_counts(&self) -> Result<RoomKeyCounts>;

    /// Get up to `limit` room keys that aren't backed up yet.
    ///
    /// Implementations must return the keys in a stable order.
    async fn sessions_for_backup(&self, limit: usize) -> Result<Vec<RoomKeySession>>;

    /// Mark the room keys with the given sender keys and session ids as
    /// backed up.
    async fn mark_as_backed_up(&self, sessions: &[(&str, &str)]) -> Result<()>;

    /// Mark every room key as not backed up.
    async fn reset_backup_state(&self) -> Result<()>;

    /// Import room keys, returns how many of them were imported.
    ///
    /// A key is only imported if it's unknown or if it can decrypt older
    /// messages than the copy we already have. Imported keys get the given
    /// backed up marker.
    async fn import_sessions(&self, sessions: Vec<RoomKeySession>, backed_up: bool)
        -> Result<usize>;

    /// Get the room key with the given room and session id.
    async fn get_session(&self, room_id: &RoomId, session_id: &str)
        -> Result<Option<RoomKeySession>>;
}

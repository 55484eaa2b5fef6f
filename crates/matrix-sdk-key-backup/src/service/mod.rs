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

//! The remote side of the backup.
//!
//! A [`BackupService`] stores backup versions and, for every version, the
//! encrypted room keys keyed by room id and session id. Only the latest
//! version accepts new keys.

mod memory;

use std::{fmt, fmt::Debug, time::Duration};

use async_trait::async_trait;
use ruma::RoomId;
use thiserror::Error;

pub use memory::{Endpoint, MemoryBackupService};

use crate::types::{BackupBlob, BackupVersionInfo, KeyBackupData, RoomKeyBackup, RoomKeyBackupInfo};

/// The kinds of errors the backup service can respond with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The backup version, or the requested key, doesn't exist.
    NotFound,
    /// Keys were uploaded to a version that isn't the latest one.
    WrongRoomKeysVersion {
        /// The latest version the service knows of.
        current_version: Option<String>,
    },
    /// Too many requests were sent.
    LimitExceeded {
        /// How long to wait before retrying.
        retry_after: Option<Duration>,
    },
    /// Any other error.
    Unknown {
        /// The HTTP status code of the response.
        status: u16,
        /// The Matrix error code.
        errcode: String,
    },
}

impl ErrorKind {
    /// Does the error tell us that the backup version we're using is gone,
    /// either because it was deleted or because a newer one was created.
    pub fn is_version_gone(&self) -> bool {
        matches!(self, ErrorKind::NotFound | ErrorKind::WrongRoomKeysVersion { .. })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => f.write_str("M_NOT_FOUND"),
            ErrorKind::WrongRoomKeysVersion { current_version } => {
                write!(f, "M_WRONG_ROOM_KEYS_VERSION (current version: {current_version:?})")
            }
            ErrorKind::LimitExceeded { .. } => f.write_str("M_LIMIT_EXCEEDED"),
            ErrorKind::Unknown { status, errcode } => write!(f, "{errcode} ({status})"),
        }
    }
}

/// Error type of the [`BackupService`].
#[derive(Clone, Debug, Error)]
pub enum ServiceError {
    /// The request didn't reach the service, or the response got lost.
    #[error("network error: {0}")]
    Network(String),

    /// The service responded with an error.
    #[error("the backup service responded with an error: {0}")]
    Server(ErrorKind),
}

impl ServiceError {
    /// The error kind if the service responded with an error.
    pub fn kind(&self) -> Option<&ErrorKind> {
        match self {
            ServiceError::Server(kind) => Some(kind),
            ServiceError::Network(_) => None,
        }
    }

    /// Could retrying the same request succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Network(_) => true,
            ServiceError::Server(ErrorKind::LimitExceeded { .. }) => true,
            ServiceError::Server(ErrorKind::Unknown { status, .. }) => *status >= 500,
            ServiceError::Server(_) => false,
        }
    }
}

/// The logical operations of the `/room_keys` API.
#[async_trait]
pub trait BackupService: Debug + Send + Sync {
    /// Get the given backup version, or the latest one if `version` is `None`.
    async fn get_version(&self, version: Option<&str>) -> Result<BackupVersionInfo, ServiceError>;

    /// Create a new backup version, returns the id of the new version.
    async fn create_version(&self, info: RoomKeyBackupInfo) -> Result<String, ServiceError>;

    /// Delete a backup version together with all of its keys.
    async fn delete_version(&self, version: &str) -> Result<(), ServiceError>;

    /// Upload a single room key.
    async fn put_room_key(
        &self,
        version: &str,
        room_id: &RoomId,
        session_id: &str,
        data: KeyBackupData,
    ) -> Result<(), ServiceError>;

    /// Upload a batch of room keys.
    async fn put_room_keys(&self, version: &str, rooms: BackupBlob) -> Result<(), ServiceError>;

    /// Download a single room key.
    async fn get_room_key(
        &self,
        version: &str,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<KeyBackupData, ServiceError>;

    /// Download all the room keys of a room.
    async fn get_room_keys_for_room(
        &self,
        version: &str,
        room_id: &RoomId,
    ) -> Result<RoomKeyBackup, ServiceError>;

    /// Download every room key of the backup version.
    async fn get_room_keys(&self, version: &str) -> Result<BackupBlob, ServiceError>;

    /// Delete a single room key.
    async fn delete_room_key(
        &self,
        version: &str,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<(), ServiceError>;
}

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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod backups;
pub mod config;
pub mod crypto;
mod error;
pub mod keys;
mod observable;
pub mod service;
mod state;
pub mod store;
pub mod types;

pub use backups::{
    BackupAllError, BackupAllGroupSessions, BackupCreationInfo, Backups, BackupsBuilder,
};
pub use error::{KeyBackupError, ProtocolError, RecoveryKeyError};
pub use state::{BackupState, BackupStateMachine, StateListenerHandle};

/// Return type for the room key importing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// The number of room keys that were imported.
    pub imported_count: usize,
    /// The total number of room keys that were found in the backup.
    pub total_count: usize,
}

impl RoomKeyImportResult {
    pub(crate) fn new(imported_count: usize, total_count: usize) -> Self {
        Self { imported_count, total_count }
    }
}

#[cfg(test)]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}

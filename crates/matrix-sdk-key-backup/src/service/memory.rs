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

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex as StdMutex,
};

use async_trait::async_trait;
use ruma::RoomId;
use tracing::trace;

use super::{BackupService, ErrorKind, ServiceError};
use crate::types::{
    BackupBlob, BackupVersionInfo, KeyBackupData, RoomKeyBackup, RoomKeyBackupInfo,
};

/// The operations of the [`BackupService`], used to count requests and to
/// inject failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// [`BackupService::get_version`]
    GetVersion,
    /// [`BackupService::create_version`]
    CreateVersion,
    /// [`BackupService::delete_version`]
    DeleteVersion,
    /// [`BackupService::put_room_key`]
    PutRoomKey,
    /// [`BackupService::put_room_keys`]
    PutRoomKeys,
    /// [`BackupService::get_room_key`]
    GetRoomKey,
    /// [`BackupService::get_room_keys_for_room`]
    GetRoomKeysForRoom,
    /// [`BackupService::get_room_keys`]
    GetRoomKeys,
    /// [`BackupService::delete_room_key`]
    DeleteRoomKey,
}

#[derive(Debug)]
struct StoredVersion {
    info: RoomKeyBackupInfo,
    rooms: BackupBlob,
    etag: u64,
}

impl StoredVersion {
    fn key_count(&self) -> usize {
        self.rooms.values().map(|r| r.sessions.len()).sum()
    }

    fn touch(&mut self) {
        self.etag += 1;
    }
}

#[derive(Debug, Default)]
struct State {
    versions: BTreeMap<u64, StoredVersion>,
    next_version: u64,
    offline: bool,
    injected_failures: HashMap<Endpoint, Vec<ServiceError>>,
    request_counts: HashMap<Endpoint, usize>,
}

impl State {
    fn latest_version(&self) -> Option<u64> {
        self.versions.keys().next_back().copied()
    }

    fn version(&self, version: &str) -> Result<&StoredVersion, ServiceError> {
        version
            .parse()
            .ok()
            .and_then(|v| self.versions.get(&v))
            .ok_or(ServiceError::Server(ErrorKind::NotFound))
    }

    /// Look up the version that new keys are uploaded to, only the latest
    /// version accepts keys.
    fn writable_version(&mut self, version: &str) -> Result<&mut StoredVersion, ServiceError> {
        let latest = self.latest_version();
        let parsed = version.parse::<u64>().ok().filter(|v| self.versions.contains_key(v));

        match parsed {
            None => Err(ServiceError::Server(ErrorKind::NotFound)),
            Some(v) if Some(v) != latest => {
                Err(ServiceError::Server(ErrorKind::WrongRoomKeysVersion {
                    current_version: latest.map(|l| l.to_string()),
                }))
            }
            Some(v) => self.versions.get_mut(&v).ok_or(ServiceError::Server(ErrorKind::NotFound)),
        }
    }

    fn describe(&self, version: u64) -> Option<BackupVersionInfo> {
        self.versions.get(&version).map(|stored| BackupVersionInfo {
            version: version.to_string(),
            info: stored.info.clone(),
            count: Some(stored.key_count() as u64),
            etag: Some(stored.etag.to_string()),
        })
    }
}

/// An in-memory [`BackupService`].
///
/// It follows the versioning rules of a homeserver: version ids are
/// increasing integers, uploads to anything but the latest version fail with
/// `M_WRONG_ROOM_KEYS_VERSION` and unknown versions with `M_NOT_FOUND`.
///
/// Every request is counted per [`Endpoint`] and failures can be injected,
/// which makes it useful in tests.
#[derive(Debug, Default)]
pub struct MemoryBackupService {
    state: StdMutex<State>,
}

impl MemoryBackupService {
    /// Create a new empty `MemoryBackupService`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following request fail with a network error, or stop doing
    /// so.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    /// Make the next request to the given endpoint fail with the given error.
    ///
    /// Multiple failures for the same endpoint are returned in the order they
    /// were injected.
    pub fn fail_next(&self, endpoint: Endpoint, error: ServiceError) {
        self.state.lock().unwrap().injected_failures.entry(endpoint).or_default().insert(0, error);
    }

    /// The number of requests the given endpoint received, failed ones
    /// included.
    pub fn request_count(&self, endpoint: Endpoint) -> usize {
        self.state.lock().unwrap().request_counts.get(&endpoint).copied().unwrap_or_default()
    }

    /// The number of requests all the endpoints received.
    pub fn total_request_count(&self) -> usize {
        self.state.lock().unwrap().request_counts.values().sum()
    }

    /// The number of keys stored in the given version.
    pub fn key_count(&self, version: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.version(version).map(StoredVersion::key_count).unwrap_or_default()
    }

    /// Run a request against the state, after counting it and checking for
    /// injected failures.
    fn request<T>(
        &self,
        endpoint: Endpoint,
        f: impl FnOnce(&mut State) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let mut state = self.state.lock().unwrap();
        *state.request_counts.entry(endpoint).or_default() += 1;

        trace!(?endpoint, "Backup service request");

        if state.offline {
            return Err(ServiceError::Network("the backup service is offline".to_owned()));
        }

        if let Some(error) = state.injected_failures.get_mut(&endpoint).and_then(Vec::pop) {
            return Err(error);
        }

        f(&mut state)
    }
}

#[async_trait]
impl BackupService for MemoryBackupService {
    async fn get_version(&self, version: Option<&str>) -> Result<BackupVersionInfo, ServiceError> {
        self.request(Endpoint::GetVersion, |state| {
            let version = match version {
                Some(v) => v.parse().ok(),
                None => state.latest_version(),
            };

            version
                .and_then(|v| state.describe(v))
                .ok_or(ServiceError::Server(ErrorKind::NotFound))
        })
    }

    async fn create_version(&self, info: RoomKeyBackupInfo) -> Result<String, ServiceError> {
        self.request(Endpoint::CreateVersion, |state| {
            state.next_version += 1;
            let version = state.next_version;

            state.versions.insert(version, StoredVersion { info, rooms: BTreeMap::new(), etag: 0 });

            Ok(version.to_string())
        })
    }

    async fn delete_version(&self, version: &str) -> Result<(), ServiceError> {
        self.request(Endpoint::DeleteVersion, |state| {
            version
                .parse()
                .ok()
                .and_then(|v| state.versions.remove(&v))
                .map(|_| ())
                .ok_or(ServiceError::Server(ErrorKind::NotFound))
        })
    }

    async fn put_room_key(
        &self,
        version: &str,
        room_id: &RoomId,
        session_id: &str,
        data: KeyBackupData,
    ) -> Result<(), ServiceError> {
        self.request(Endpoint::PutRoomKey, |state| {
            let stored = state.writable_version(version)?;
            stored
                .rooms
                .entry(room_id.to_owned())
                .or_default()
                .sessions
                .insert(session_id.to_owned(), data);
            stored.touch();

            Ok(())
        })
    }

    async fn put_room_keys(&self, version: &str, rooms: BackupBlob) -> Result<(), ServiceError> {
        self.request(Endpoint::PutRoomKeys, |state| {
            let stored = state.writable_version(version)?;

            for (room_id, room) in rooms {
                stored.rooms.entry(room_id).or_default().sessions.extend(room.sessions);
            }
            stored.touch();

            Ok(())
        })
    }

    async fn get_room_key(
        &self,
        version: &str,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<KeyBackupData, ServiceError> {
        self.request(Endpoint::GetRoomKey, |state| {
            state
                .version(version)?
                .rooms
                .get(room_id)
                .and_then(|room| room.sessions.get(session_id))
                .cloned()
                .ok_or(ServiceError::Server(ErrorKind::NotFound))
        })
    }

    async fn get_room_keys_for_room(
        &self,
        version: &str,
        room_id: &RoomId,
    ) -> Result<RoomKeyBackup, ServiceError> {
        self.request(Endpoint::GetRoomKeysForRoom, |state| {
            Ok(state.version(version)?.rooms.get(room_id).cloned().unwrap_or_default())
        })
    }

    async fn get_room_keys(&self, version: &str) -> Result<BackupBlob, ServiceError> {
        self.request(Endpoint::GetRoomKeys, |state| Ok(state.version(version)?.rooms.clone()))
    }

    async fn delete_room_key(
        &self,
        version: &str,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<(), ServiceError> {
        self.request(Endpoint::DeleteRoomKey, |state| {
            let stored = state.writable_version(version)?;

            if let Some(room) = stored.rooms.get_mut(room_id) {
                room.sessions.remove(session_id);

                if room.sessions.is_empty() {
                    stored.rooms.remove(room_id);
                }
            }
            stored.touch();

            Ok(())
        })
    }
}

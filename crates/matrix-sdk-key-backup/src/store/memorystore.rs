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

use std::{collections::BTreeMap, sync::RwLock as StdRwLock};

use async_trait::async_trait;
use ruma::RoomId;

use super::{KeyBackupStore, Result};
use crate::types::{RoomKeyCounts, RoomKeySession};

/// Sessions are keyed by sender key and session id.
type SessionKey = (String, String);

#[derive(Debug)]
struct StoredSession {
    session: RoomKeySession,
    backed_up: bool,
}

/// An in-memory only store that will forget all the room keys once it's
/// dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: StdRwLock<BTreeMap<SessionKey, StoredSession>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a room key that still needs to be backed up.
    pub fn add_session(&self, session: RoomKeySession) {
        self.sessions.write().unwrap().insert(
            (session.sender_key.clone(), session.session_id.clone()),
            StoredSession { session, backed_up: false },
        );
    }
}

#[async_trait]
impl KeyBackupStore for MemoryStore {
    async fn room_key_counts(&self) -> Result<RoomKeyCounts> {
        let sessions = self.sessions.read().unwrap();

        Ok(RoomKeyCounts {
            total: sessions.len(),
            backed_up: sessions.values().filter(|s| s.backed_up).count(),
        })
    }

    async fn sessions_for_backup(&self, limit: usize) -> Result<Vec<RoomKeySession>> {
        Ok(self
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| !s.backed_up)
            .take(limit)
            .map(|s| s.session.clone())
            .collect())
    }

    async fn mark_as_backed_up(&self, sessions: &[(&str, &str)]) -> Result<()> {
        let mut stored = self.sessions.write().unwrap();

        for &(sender_key, session_id) in sessions {
            if let Some(s) = stored.get_mut(&(sender_key.to_owned(), session_id.to_owned())) {
                s.backed_up = true;
            }
        }

        Ok(())
    }

    async fn reset_backup_state(&self) -> Result<()> {
        for session in self.sessions.write().unwrap().values_mut() {
            session.backed_up = false;
        }

        Ok(())
    }

    async fn import_sessions(
        &self,
        sessions: Vec<RoomKeySession>,
        backed_up: bool,
    ) -> Result<usize> {
        let mut stored = self.sessions.write().unwrap();
        let mut imported = 0;

        for session in sessions {
            let key = (session.sender_key.clone(), session.session_id.clone());

            let is_better = stored
                .get(&key)
                .is_none_or(|old| session.first_known_index < old.session.first_known_index);

            if is_better {
                stored.insert(key, StoredSession { session, backed_up });
                imported += 1;
            }
        }

        Ok(imported)
    }

    async fn get_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<RoomKeySession>> {
        Ok(self
            .sessions
            .read()
            .unwrap()
            .values()
            .find(|s| &*s.session.room_id == room_id && s.session.session_id == session_id)
            .map(|s| s.session.clone()))
    }
}

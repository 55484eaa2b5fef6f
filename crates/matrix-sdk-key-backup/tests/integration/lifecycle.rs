// Copyright 2023 The Matrix.org Foundation C.I.C.
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

use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use futures_util::StreamExt;
use matrix_sdk_key_backup::{
    crypto::SignatureState,
    service::{Endpoint, MemoryBackupService},
    types::RoomKeyCounts,
    BackupAllError, BackupState, Backups, KeyBackupError,
};
use ruma::{device_id, room_id};

use crate::{alice_device, room_key, wait_for_state, Device};

#[tokio::test]
async fn created_backups_are_signed_and_enabled() {
    let service = Arc::new(MemoryBackupService::new());
    let alice = alice_device(&service);

    assert!(!alice.backups.exists_on_server().await.unwrap());
    assert_eq!(alice.backups.check_and_start_key_backup().await.unwrap(), BackupState::Disabled);

    let info = alice.backups.prepare_backup_version(None).await.unwrap();
    assert_eq!(info.auth_data().public_key, info.decryption_key().public_key());
    assert!(Backups::is_valid_recovery_key(&info.recovery_key()));

    let version = alice.backups.create_and_enable(&info).await.unwrap();
    assert!(alice.backups.is_enabled());
    assert_eq!(alice.backups.current_version().unwrap().version, version.version);

    let on_server = alice.backups.get_version(None).await.unwrap().unwrap();
    assert_eq!(on_server.version, version.version);
    assert_eq!(on_server.info, info.backup_info());
    assert_eq!(alice.backups.verify_backup(&on_server), SignatureState::ValidAndTrusted);
    assert!(alice.backups.exists_on_server().await.unwrap());
}

#[tokio::test]
async fn all_room_keys_get_backed_up() {
    let service = Arc::new(MemoryBackupService::new());
    let alice = alice_device(&service);

    for i in 0..5 {
        alice.store.add_session(room_key(room_id!("!cheese:localhost"), &format!("session_{i}")));
    }

    alice.enable_backups().await;

    let backup = alice.backups.backup_all_group_sessions();
    let progress = backup.subscribe_to_progress();

    backup.await.unwrap();

    let progress: Vec<_> = progress.filter_map(|p| async move { p.ok() }).collect().await;
    assert!(progress.contains(&RoomKeyCounts { total: 5, backed_up: 0 }));
    assert_eq!(progress.last(), Some(&RoomKeyCounts { total: 5, backed_up: 5 }));

    // A batch size of two means three chunks.
    assert_eq!(service.request_count(Endpoint::PutRoomKeys), 3);

    let version = alice.backups.current_version().unwrap();
    assert_eq!(service.key_count(&version.version), 5);
    assert_eq!(alice.backups.state(), BackupState::ReadyToBackUp);

    // New room keys get backed up once an upload is scheduled.
    alice.store.add_session(room_key(room_id!("!cheese:localhost"), "new_session"));
    alice.backups.maybe_send_key_backup();
    wait_for_state(&alice.backups, BackupState::ReadyToBackUp).await;

    assert_eq!(service.key_count(&version.version), 6);
    assert!(alice.backups.room_key_counts().await.unwrap().is_complete());
}

#[tokio::test]
async fn deleting_the_active_version_disables_backups() {
    let service = Arc::new(MemoryBackupService::new());
    let alice = alice_device(&service);

    alice.store.add_session(room_key(room_id!("!cheese:localhost"), "session"));
    alice.enable_backups().await;
    alice.backups.backup_all_group_sessions().await.unwrap();

    let version = alice.backups.current_version().unwrap();
    alice.backups.delete_version(&version.version).await.unwrap();

    assert_eq!(alice.backups.state(), BackupState::Disabled);
    assert!(alice.backups.current_version().is_none());
    assert_eq!(alice.backups.room_key_counts().await.unwrap().backed_up, 0);
    assert!(!alice.backups.exists_on_server().await.unwrap());

    let uploads = service.request_count(Endpoint::PutRoomKeys);

    alice.backups.maybe_send_key_backup();
    assert_matches!(
        alice.backups.backup_all_group_sessions().await,
        Err(BackupAllError::BackupDisabled)
    );
    assert_eq!(service.request_count(Endpoint::PutRoomKeys), uploads);
}

#[tokio::test]
async fn deleting_another_version_keeps_backups_enabled() {
    let service = Arc::new(MemoryBackupService::new());
    let alice = alice_device(&service);

    alice.enable_backups().await;
    let first = alice.backups.current_version().unwrap();

    let info = alice.backups.prepare_backup_version(None).await.unwrap();
    let second = alice.backups.create_and_enable(&info).await.unwrap();

    alice.backups.delete_version(&first.version).await.unwrap();

    assert!(alice.backups.is_enabled());
    assert_eq!(alice.backups.current_version().unwrap().version, second.version);
}

#[tokio::test]
async fn state_changes_follow_the_transition_graph() {
    let service = Arc::new(MemoryBackupService::new());
    let alice = alice_device(&service);

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let previous = Arc::new(Mutex::new(alice.backups.state()));

    let handle = alice.backups.add_state_listener({
        let transitions = transitions.clone();

        move |state| {
            let mut previous = previous.lock().unwrap();
            transitions.lock().unwrap().push((*previous, state));
            *previous = state;
        }
    });

    for i in 0..3 {
        alice.store.add_session(room_key(room_id!("!cheese:localhost"), &format!("session_{i}")));
    }

    alice.enable_backups().await;
    alice.backups.backup_all_group_sessions().await.unwrap();

    let version = alice.backups.current_version().unwrap();
    alice.backups.delete_version(&version.version).await.unwrap();

    alice.enable_backups().await;
    alice.backups.backup_all_group_sessions().await.unwrap();

    assert!(alice.backups.remove_state_listener(handle));

    let transitions = transitions.lock().unwrap();
    assert!(transitions.contains(&(BackupState::WillBackUp, BackupState::BackingUp)));
    assert!(transitions.contains(&(BackupState::BackingUp, BackupState::WillBackUp)));

    for (from, to) in transitions.iter() {
        assert!(from.can_transition_to(*to), "Invalid transition from {from:?} to {to:?}");
    }
}

#[tokio::test]
async fn trusted_backups_are_enabled_on_start() {
    let service = Arc::new(MemoryBackupService::new());
    let alice = alice_device(&service);
    alice.enable_backups().await;
    let version = alice.backups.current_version().unwrap();

    // The same device, with a fresh key store.
    let restarted = Device::with_identity(&service, alice.identity.clone());
    restarted.store.add_session(room_key(room_id!("!cheese:localhost"), "session"));

    restarted.backups.check_and_start_key_backup().await.unwrap();
    assert!(restarted.backups.is_enabled());
    assert_eq!(restarted.backups.current_version().unwrap().version, version.version);

    restarted.backups.backup_all_group_sessions().await.unwrap();
    assert_eq!(service.key_count(&version.version), 1);

    // Checking again doesn't change anything.
    assert_eq!(
        restarted.backups.check_and_start_key_backup().await.unwrap(),
        restarted.backups.state()
    );
}

#[tokio::test]
async fn untrusted_backups_stay_disabled() {
    let service = Arc::new(MemoryBackupService::new());
    let alice = alice_device(&service);
    alice.enable_backups().await;

    let other = Device::new(&service, device_id!("OTHERDEVICE"));

    assert_eq!(other.backups.check_and_start_key_backup().await.unwrap(), BackupState::Disabled);
    assert!(other.backups.current_version().is_none());

    let version = other.backups.get_version(None).await.unwrap().unwrap();
    assert_eq!(other.backups.verify_backup(&version), SignatureState::Missing);
}

#[tokio::test]
async fn checking_while_offline_keeps_the_state_unknown() {
    let service = Arc::new(MemoryBackupService::new());
    let alice = alice_device(&service);

    service.set_offline(true);
    assert_matches!(
        alice.backups.check_and_start_key_backup().await,
        Err(KeyBackupError::Network(_))
    );
    assert_eq!(alice.backups.state(), BackupState::Unknown);

    service.set_offline(false);
    assert_eq!(alice.backups.check_and_start_key_backup().await.unwrap(), BackupState::Disabled);
}

#[tokio::test]
async fn enabling_with_a_recovery_key() {
    let service = Arc::new(MemoryBackupService::new());
    let alice = alice_device(&service);
    let recovery_key = alice.enable_backups().await;
    let version = alice.backups.current_version().unwrap();

    let other = Device::new(&service, device_id!("OTHERDEVICE"));
    other.store.add_session(room_key(room_id!("!cheese:localhost"), "session"));

    // Backups can't be enabled before the state is known.
    assert_matches!(
        other.backups.enable_with_recovery_key(&version, &recovery_key).await,
        Err(KeyBackupError::InvariantViolation(_))
    );

    other.backups.check_and_start_key_backup().await.unwrap();

    let wrong_key = other.backups.prepare_backup_version(None).await.unwrap().recovery_key();
    assert!(!other.backups.enable_with_recovery_key(&version, &wrong_key).await.unwrap());
    assert_eq!(other.backups.state(), BackupState::Disabled);

    assert!(other.backups.enable_with_recovery_key(&version, &recovery_key).await.unwrap());
    assert!(other.backups.is_enabled());

    other.backups.backup_all_group_sessions().await.unwrap();
    assert_eq!(service.key_count(&version.version), 1);
}

#[tokio::test]
async fn disabling_keeps_the_version_on_the_server() {
    let service = Arc::new(MemoryBackupService::new());
    let alice = alice_device(&service);
    alice.enable_backups().await;
    let version = alice.backups.current_version().unwrap();

    alice.backups.disable().await.unwrap();

    assert_eq!(alice.backups.state(), BackupState::Disabled);
    assert!(alice.backups.current_version().is_none());
    assert_eq!(
        alice.backups.get_version(None).await.unwrap().map(|v| v.version),
        Some(version.version)
    );
}

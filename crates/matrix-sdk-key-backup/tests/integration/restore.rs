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

use std::sync::Arc;

use assert_matches::assert_matches;
use matrix_sdk_key_backup::{
    keys::DecodeError,
    service::{BackupService, MemoryBackupService},
    store::KeyBackupStore,
    types::{EncryptedSessionData, KeyBackupData},
    BackupState, KeyBackupError, ProtocolError, RecoveryKeyError, RoomKeyImportResult,
};
use ruma::{device_id, room_id};

use crate::{alice_device, room_key, Device};

/// Alice backs up three room keys, two of them in the same room, and returns
/// the recovery key.
async fn alice_with_backup(service: &Arc<MemoryBackupService>) -> (Device, String) {
    let alice = alice_device(service);

    alice.store.add_session(room_key(room_id!("!cheese:localhost"), "first"));
    alice.store.add_session(room_key(room_id!("!cheese:localhost"), "second"));
    alice.store.add_session(room_key(room_id!("!wine:localhost"), "third"));

    let recovery_key = alice.enable_backups().await;
    alice.backups.backup_all_group_sessions().await.unwrap();

    (alice, recovery_key)
}

#[tokio::test]
async fn restore_everything() {
    let service = Arc::new(MemoryBackupService::new());
    let (alice, recovery_key) = alice_with_backup(&service).await;
    let version = alice.backups.current_version().unwrap();

    let other = Device::new(&service, device_id!("OTHERDEVICE"));
    other.backups.check_and_start_key_backup().await.unwrap();

    let result =
        other.backups.restore_key_backup(&version, &recovery_key, None, None).await.unwrap();
    assert_eq!(result, RoomKeyImportResult { imported_count: 3, total_count: 3 });

    let restored = other
        .store
        .get_session(room_id!("!wine:localhost"), "third")
        .await
        .unwrap()
        .expect("The room key should have been restored");
    let original = room_key(room_id!("!wine:localhost"), "third");

    assert_eq!(restored.session_key.as_str(), original.session_key.as_str());
    assert_eq!(restored.sender_key, original.sender_key);
    assert_eq!(restored.sender_claimed_keys, original.sender_claimed_keys);

    // Backups are disabled on the other device, nothing gets uploaded.
    assert_eq!(other.backups.state(), BackupState::Disabled);
    assert_eq!(other.backups.room_key_counts().await.unwrap().backed_up, 0);

    // Restoring again doesn't import anything new.
    let result =
        other.backups.restore_key_backup(&version, &recovery_key, None, None).await.unwrap();
    assert_eq!(result, RoomKeyImportResult { imported_count: 0, total_count: 3 });
}

#[tokio::test]
async fn restore_a_room_or_a_single_key() {
    let service = Arc::new(MemoryBackupService::new());
    let (alice, recovery_key) = alice_with_backup(&service).await;
    let version = alice.backups.current_version().unwrap();

    let other = Device::new(&service, device_id!("OTHERDEVICE"));
    let cheese = room_id!("!cheese:localhost");

    let result = other
        .backups
        .restore_key_backup(&version, &recovery_key, Some(cheese), Some("second"))
        .await
        .unwrap();
    assert_eq!(result, RoomKeyImportResult { imported_count: 1, total_count: 1 });

    let result = other
        .backups
        .restore_key_backup(&version, &recovery_key, Some(cheese), None)
        .await
        .unwrap();
    assert_eq!(result, RoomKeyImportResult { imported_count: 1, total_count: 2 });

    let result = other
        .backups
        .restore_key_backup(&version, &recovery_key, None, Some("third"))
        .await
        .unwrap();
    assert_eq!(result, RoomKeyImportResult { imported_count: 1, total_count: 1 });

    let result = other
        .backups
        .restore_key_backup(&version, &recovery_key, Some(cheese), Some("unknown"))
        .await
        .unwrap();
    assert_eq!(result, RoomKeyImportResult { imported_count: 0, total_count: 0 });
}

#[tokio::test]
async fn wrong_recovery_keys_are_rejected_before_downloading() {
    let service = Arc::new(MemoryBackupService::new());
    let (alice, _) = alice_with_backup(&service).await;
    let version = alice.backups.current_version().unwrap();

    let other = Device::new(&service, device_id!("OTHERDEVICE"));
    let wrong_key = other.backups.prepare_backup_version(None).await.unwrap().recovery_key();

    let requests = service.total_request_count();

    assert_matches!(
        other.backups.restore_key_backup(&version, &wrong_key, None, None).await,
        Err(KeyBackupError::InvalidRecoveryKey(RecoveryKeyError::KeyMismatch))
    );
    assert_matches!(
        other.backups.restore_key_backup(&version, "l0l, not a key", None, None).await,
        Err(KeyBackupError::InvalidRecoveryKey(RecoveryKeyError::Decode(DecodeError::Base58(_))))
    );

    assert_eq!(service.total_request_count(), requests);
    assert_eq!(other.backups.room_key_counts().await.unwrap().total, 0);
}

#[tokio::test]
async fn undecryptable_entries_are_skipped() {
    let service = Arc::new(MemoryBackupService::new());
    let (alice, recovery_key) = alice_with_backup(&service).await;
    let version = alice.backups.current_version().unwrap();

    let corrupted = KeyBackupData {
        first_message_index: 0,
        forwarded_count: 0,
        is_verified: false,
        session_data: EncryptedSessionData {
            ephemeral: "not a curve key".to_owned(),
            ciphertext: "bm90IGEgY2lwaGVydGV4dA".to_owned(),
            mac: "bm90IGEgbWFj".to_owned(),
        },
    };
    service
        .put_room_key(&version.version, room_id!("!wine:localhost"), "corrupted", corrupted)
        .await
        .unwrap();

    // A well formed entry whose MAC belongs to a different ciphertext.
    let mut tampered =
        service.get_room_key(&version.version, room_id!("!wine:localhost"), "third").await.unwrap();
    let other_entry = service
        .get_room_key(&version.version, room_id!("!cheese:localhost"), "first")
        .await
        .unwrap();
    tampered.session_data.mac = other_entry.session_data.mac;
    service
        .put_room_key(&version.version, room_id!("!wine:localhost"), "tampered", tampered)
        .await
        .unwrap();

    let other = Device::new(&service, device_id!("OTHERDEVICE"));

    let result =
        other.backups.restore_key_backup(&version, &recovery_key, None, None).await.unwrap();
    assert_eq!(result, RoomKeyImportResult { imported_count: 3, total_count: 5 });

    for session_id in ["corrupted", "tampered"] {
        assert!(other
            .store
            .get_session(room_id!("!wine:localhost"), session_id)
            .await
            .unwrap()
            .is_none());
    }
}

#[tokio::test]
async fn restore_with_a_passphrase() {
    let service = Arc::new(MemoryBackupService::new());
    let alice = alice_device(&service);
    alice.store.add_session(room_key(room_id!("!cheese:localhost"), "session"));

    alice.backups.check_and_start_key_backup().await.unwrap();
    let info =
        alice.backups.prepare_backup_version(Some("It's a secret to everybody")).await.unwrap();
    assert_eq!(info.auth_data().passphrase_info().map(|(_, i)| i), Some(1000));

    let version = alice.backups.create_and_enable(&info).await.unwrap();
    alice.backups.backup_all_group_sessions().await.unwrap();

    let other = Device::new(&service, device_id!("OTHERDEVICE"));

    let result = other
        .backups
        .restore_key_backup_with_passphrase(&version, "It's a secret to everybody", None, None)
        .await
        .unwrap();
    assert_eq!(result, RoomKeyImportResult { imported_count: 1, total_count: 1 });

    assert_matches!(
        other.backups.restore_key_backup_with_passphrase(&version, "wrong", None, None).await,
        Err(KeyBackupError::InvalidRecoveryKey(RecoveryKeyError::KeyMismatch))
    );
}

#[tokio::test]
async fn passphrase_restore_needs_passphrase_info() {
    let service = Arc::new(MemoryBackupService::new());
    let (alice, _) = alice_with_backup(&service).await;
    let version = alice.backups.current_version().unwrap();

    assert_matches!(
        alice.backups.restore_key_backup_with_passphrase(&version, "secret", None, None).await,
        Err(KeyBackupError::Protocol(ProtocolError::MissingPassphraseInfo))
    );
}

#[tokio::test]
async fn keys_restored_from_another_version_get_backed_up() {
    let service = Arc::new(MemoryBackupService::new());
    let (alice, recovery_key) = alice_with_backup(&service).await;
    let old_version = alice.backups.current_version().unwrap();

    // The other device replaces the backup with its own version.
    let other = Device::new(&service, device_id!("OTHERDEVICE"));
    other.enable_backups().await;
    other.backups.backup_all_group_sessions().await.unwrap();
    let new_version = other.backups.current_version().unwrap();
    assert_ne!(old_version.version, new_version.version);

    let result =
        other.backups.restore_key_backup(&old_version, &recovery_key, None, None).await.unwrap();
    assert_eq!(result.imported_count, 3);

    other.backups.backup_all_group_sessions().await.unwrap();
    assert_eq!(service.key_count(&new_version.version), 3);
    assert!(other.backups.room_key_counts().await.unwrap().is_complete());
}

#[tokio::test]
async fn keys_restored_from_the_active_version_count_as_backed_up() {
    let service = Arc::new(MemoryBackupService::new());
    let (alice, recovery_key) = alice_with_backup(&service).await;
    let version = alice.backups.current_version().unwrap();

    // The same device, with a fresh key store.
    let restarted = Device::with_identity(&service, alice.identity.clone());
    restarted.backups.check_and_start_key_backup().await.unwrap();
    assert!(restarted.backups.is_enabled());

    let result =
        restarted.backups.restore_key_backup(&version, &recovery_key, None, None).await.unwrap();
    assert_eq!(result.imported_count, 3);

    let counts = restarted.backups.room_key_counts().await.unwrap();
    assert!(counts.is_complete());
    assert_eq!(counts.total, 3);
}

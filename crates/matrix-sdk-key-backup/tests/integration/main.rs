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

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures_util::{pin_mut, StreamExt};
use matrix_sdk_key_backup::{
    config::{BackupSettings, FixedUploadDelay},
    crypto::DeviceIdentity,
    service::MemoryBackupService,
    store::MemoryStore,
    types::{RoomKeySession, MEGOLM_V1_AES_SHA2},
    BackupState, Backups,
};
use ruma::{device_id, user_id, DeviceId, RoomId};

mod lifecycle;
mod restore;

#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}

/// A device of `@alice:localhost`, with its own key store.
struct Device {
    backups: Backups,
    store: Arc<MemoryStore>,
    identity: Arc<DeviceIdentity>,
}

impl Device {
    fn new(service: &Arc<MemoryBackupService>, device_id: &DeviceId) -> Self {
        let identity = Arc::new(DeviceIdentity::new(user_id!("@alice:localhost"), device_id));
        Self::with_identity(service, identity)
    }

    /// A new key store for an existing device.
    fn with_identity(service: &Arc<MemoryBackupService>, identity: Arc<DeviceIdentity>) -> Self {
        let store = Arc::new(MemoryStore::new());

        let backups = Backups::builder(identity.clone(), store.clone(), service.clone())
            .settings(BackupSettings::new().batch_size(2).passphrase_iterations(1000))
            .upload_delay(Arc::new(FixedUploadDelay(Duration::ZERO)))
            .build();

        Self { backups, store, identity }
    }

    /// Check the backup state and create a new backup version, returns the
    /// recovery key.
    async fn enable_backups(&self) -> String {
        self.backups.check_and_start_key_backup().await.unwrap();

        let info = self.backups.prepare_backup_version(None).await.unwrap();
        self.backups.create_and_enable(&info).await.unwrap();

        info.recovery_key().to_string()
    }
}

fn alice_device(service: &Arc<MemoryBackupService>) -> Device {
    Device::new(service, device_id!("ALICEDEVICE"))
}

fn room_key(room_id: &RoomId, session_id: &str) -> RoomKeySession {
    RoomKeySession {
        algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
        room_id: room_id.to_owned(),
        sender_key: "ySZxbY4rCPbbEVKOb1xD5gcfeKUSTCyKDXKp2KV7r0E".to_owned(),
        session_id: session_id.to_owned(),
        session_key: format!("key material of {session_id}").into(),
        sender_claimed_keys: BTreeMap::from([(
            "ed25519".to_owned(),
            "hQRWQuQNIfLx1Xj6ZeTfxw4tU5KzfVFqbeGBnsKLM7A".to_owned(),
        )]),
        forwarding_curve25519_key_chain: Vec::new(),
        first_known_index: 0,
        forwarded_count: 0,
        verified: true,
    }
}

async fn wait_for_state(backups: &Backups, expected: BackupState) {
    let stream = backups.state_stream();
    pin_mut!(stream);

    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(state) = stream.next().await {
            if state.ok() == Some(expected) {
                return;
            }
        }

        panic!("The state stream ended before reaching {expected:?}");
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for the {expected:?} state"));
}

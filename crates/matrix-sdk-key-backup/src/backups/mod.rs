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

//! Server-side backups of room keys.
//!
//! [`Backups`] creates backup versions, keeps the room keys of the local store
//! uploaded to the active version and restores room keys from a backup given
//! a recovery key or passphrase.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock as StdRwLock},
};

use futures_core::Stream;
use ruma::RoomId;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, instrument, trace, warn};
use zeroize::Zeroizing;

pub use self::futures::{BackupAllError, BackupAllGroupSessions};
use self::tasks::BackupUploadingTask;
use crate::{
    config::{BackupSettings, RandomUploadDelay, UploadDelay},
    crypto::{
        sign_auth_data, verify_auth_data, BackupCrypto, CryptoUnavailable, Curve25519AesSha2,
        DeviceSigner, SignatureState,
    },
    error::{KeyBackupError, ProtocolError, RecoveryKeyError},
    keys::{BackupDecryptionKey, BackupEncryptionKey},
    observable::ChannelObservable,
    service::{BackupService, ErrorKind, ServiceError},
    state::{BackupState, BackupStateMachine, StateListenerHandle},
    store::{CryptoStoreError, KeyBackupStore},
    types::{
        BackupBlob, BackupVersionInfo, MegolmV1AuthData, RoomKeyBackup, RoomKeyBackupInfo,
        RoomKeyCounts, MEGOLM_BACKUP_V1,
    },
    RoomKeyImportResult,
};

mod futures;
mod tasks;

/// Everything that is needed to create a new backup version.
///
/// Created by [`Backups::prepare_backup_version`], contains the signed auth
/// data that gets uploaded and the private key the user needs to keep.
pub struct BackupCreationInfo {
    auth_data: MegolmV1AuthData,
    decryption_key: BackupDecryptionKey,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for BackupCreationInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupCreationInfo")
            .field("algorithm", &self.algorithm())
            .field("auth_data", &self.auth_data)
            .finish_non_exhaustive()
    }
}

impl BackupCreationInfo {
    /// The backup algorithm of the new version.
    pub fn algorithm(&self) -> &'static str {
        MEGOLM_BACKUP_V1
    }

    /// The signed auth data of the new version.
    pub fn auth_data(&self) -> &MegolmV1AuthData {
        &self.auth_data
    }

    /// The algorithm and auth data, as they are sent to the backup service.
    pub fn backup_info(&self) -> RoomKeyBackupInfo {
        RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(self.auth_data.clone())
    }

    /// The recovery key, in the space separated form that is shown to users.
    pub fn recovery_key(&self) -> Zeroizing<String> {
        Zeroizing::new(self.decryption_key.to_string())
    }

    /// The private key of the new version.
    pub fn decryption_key(&self) -> &BackupDecryptionKey {
        &self.decryption_key
    }
}

/// The outcome of uploading a single chunk of room keys.
enum ChunkUpload {
    /// The chunk was full, more room keys might be waiting.
    MoreKeys,
    /// Every room key is backed up.
    Done,
    /// The backup was disabled or replaced while a failed upload was waiting
    /// to be retried.
    Interrupted,
}

/// The backup version room keys are uploaded to, together with its public
/// key.
#[derive(Clone, Debug)]
struct ActiveBackup {
    version: BackupVersionInfo,
    key: BackupEncryptionKey,
}

pub(crate) struct BackupsInner {
    signer: Arc<dyn DeviceSigner>,
    crypto: Arc<dyn BackupCrypto>,
    store: Arc<dyn KeyBackupStore>,
    service: Arc<dyn BackupService>,
    settings: BackupSettings,
    upload_delay: Arc<dyn UploadDelay>,
    state: BackupStateMachine,
    /// Only modified while the upload lock is held.
    active: StdRwLock<Option<ActiveBackup>>,
    /// Serializes the creation, enabling and disabling of backup versions.
    modify_lock: Mutex<()>,
    /// Held while a chunk of room keys is uploaded, but not while a failed
    /// upload waits to be retried.
    upload_lock: Mutex<()>,
    upload_failures: broadcast::Sender<()>,
    upload_task: BackupUploadingTask,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for BackupsInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupsInner")
            .field("signer", &self.signer)
            .field("settings", &self.settings)
            .field("state", &self.state)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Backups`].
#[derive(Debug)]
pub struct BackupsBuilder {
    signer: Arc<dyn DeviceSigner>,
    store: Arc<dyn KeyBackupStore>,
    service: Arc<dyn BackupService>,
    crypto: Arc<dyn BackupCrypto>,
    settings: BackupSettings,
    upload_delay: Arc<dyn UploadDelay>,
}

impl BackupsBuilder {
    /// Use a different [`BackupCrypto`] than [`Curve25519AesSha2`].
    #[must_use]
    pub fn crypto(mut self, crypto: Arc<dyn BackupCrypto>) -> Self {
        self.crypto = crypto;
        self
    }

    /// Set the [`BackupSettings`].
    #[must_use]
    pub fn settings(mut self, settings: BackupSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use a different [`UploadDelay`] than [`RandomUploadDelay`].
    #[must_use]
    pub fn upload_delay(mut self, upload_delay: Arc<dyn UploadDelay>) -> Self {
        self.upload_delay = upload_delay;
        self
    }

    /// Create the [`Backups`] and spawn its upload task.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn build(self) -> Backups {
        let Self { signer, store, service, crypto, settings, upload_delay } = self;
        let (upload_failures, _) = broadcast::channel(16);

        let inner = Arc::new_cyclic(|weak| BackupsInner {
            signer,
            crypto,
            store,
            service,
            settings,
            upload_delay,
            state: BackupStateMachine::new(),
            active: Default::default(),
            modify_lock: Default::default(),
            upload_lock: Default::default(),
            upload_failures,
            upload_task: BackupUploadingTask::new(weak.clone()),
        });

        Backups { inner }
    }
}

async fn derive_key_from_passphrase(
    passphrase: &str,
    salt: String,
    iterations: u32,
) -> Result<BackupDecryptionKey, CryptoUnavailable> {
    let passphrase = Zeroizing::new(passphrase.to_owned());

    tokio::task::spawn_blocking(move || {
        BackupDecryptionKey::from_passphrase(&passphrase, &salt, iterations)
    })
    .await
    .map_err(|e| CryptoUnavailable(e.to_string()))
}

/// The server-side backup of room keys.
#[derive(Clone, Debug)]
pub struct Backups {
    pub(crate) inner: Arc<BackupsInner>,
}

impl Backups {
    /// Create a builder for a new [`Backups`].
    pub fn builder(
        signer: Arc<dyn DeviceSigner>,
        store: Arc<dyn KeyBackupStore>,
        service: Arc<dyn BackupService>,
    ) -> BackupsBuilder {
        BackupsBuilder {
            signer,
            store,
            service,
            crypto: Arc::new(Curve25519AesSha2),
            settings: BackupSettings::default(),
            upload_delay: Arc::new(RandomUploadDelay),
        }
    }

    /// Create a new [`Backups`] with the default settings.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new(
        signer: Arc<dyn DeviceSigner>,
        store: Arc<dyn KeyBackupStore>,
        service: Arc<dyn BackupService>,
    ) -> Self {
        Self::builder(signer, store, service).build()
    }

    /// Get the current [`BackupState`].
    pub fn state(&self) -> BackupState {
        self.inner.state.state()
    }

    /// Are room keys currently being uploaded to a backup.
    pub fn is_enabled(&self) -> bool {
        self.state().is_enabled()
    }

    /// Get a stream of the [`BackupState`], starting with the current one.
    pub fn state_stream(
        &self,
    ) -> impl Stream<Item = Result<BackupState, BroadcastStreamRecvError>> {
        self.inner.state.subscribe()
    }

    /// Add a listener that gets called synchronously on every state change.
    pub fn add_state_listener(
        &self,
        listener: impl Fn(BackupState) + Send + Sync + 'static,
    ) -> StateListenerHandle {
        self.inner.state.add_listener(listener)
    }

    /// Remove a listener added with [`Backups::add_state_listener`].
    pub fn remove_state_listener(&self, handle: StateListenerHandle) -> bool {
        self.inner.state.remove_listener(handle)
    }

    /// The backup version room keys are uploaded to, if backups are enabled.
    pub fn current_version(&self) -> Option<BackupVersionInfo> {
        self.active_backup().map(|a| a.version)
    }

    fn active_backup(&self) -> Option<ActiveBackup> {
        self.inner.active.read().unwrap().clone()
    }

    /// The number of room keys in the store and how many of them are backed
    /// up.
    pub async fn room_key_counts(&self) -> Result<RoomKeyCounts, CryptoStoreError> {
        self.inner.store.room_key_counts().await
    }

    /// Check if the given string is a well formed recovery key.
    pub fn is_valid_recovery_key(recovery_key: &str) -> bool {
        BackupDecryptionKey::from_base58(recovery_key).is_ok()
    }

    /// Check if the backup was signed by the identity key of this device.
    pub fn verify_backup(&self, version: &BackupVersionInfo) -> SignatureState {
        let Ok(auth_data) = version.info.megolm_v1_auth_data() else {
            return SignatureState::Missing;
        };

        verify_auth_data(self.inner.signer.as_ref(), auth_data).unwrap_or_else(|e| {
            debug!("Couldn't verify the backup signature: {e}");
            SignatureState::Invalid
        })
    }

    /// Get the given backup version, or the latest one if `version` is
    /// `None`. Returns `None` if the version doesn't exist.
    pub async fn get_version(
        &self,
        version: Option<&str>,
    ) -> Result<Option<BackupVersionInfo>, KeyBackupError> {
        match self.inner.service.get_version(version).await {
            Ok(version) => Ok(Some(version)),
            Err(ServiceError::Server(ErrorKind::NotFound)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Does a backup version exist on the server.
    pub async fn exists_on_server(&self) -> Result<bool, KeyBackupError> {
        Ok(self.get_version(None).await?.is_some())
    }

    /// Generate the key pair and the signed auth data for a new backup
    /// version.
    ///
    /// If a passphrase is given the private key is derived from it, the salt
    /// and iteration count are stored in the auth data. Nothing is sent to
    /// the backup service.
    #[instrument(skip_all)]
    pub async fn prepare_backup_version(
        &self,
        passphrase: Option<&str>,
    ) -> Result<BackupCreationInfo, KeyBackupError> {
        let (decryption_key, passphrase_info) = match passphrase {
            Some(passphrase) => {
                let salt = BackupDecryptionKey::generate_salt();
                let iterations = self.inner.settings.passphrase_iterations;
                let key = derive_key_from_passphrase(passphrase, salt.clone(), iterations).await?;

                (key, Some((salt, iterations)))
            }
            None => (self.inner.crypto.generate_decryption_key()?, None),
        };

        let mut auth_data = MegolmV1AuthData::new(decryption_key.public_key());

        if let Some((salt, iterations)) = passphrase_info {
            auth_data.private_key_salt = Some(salt);
            auth_data.private_key_iterations = Some(iterations);
        }

        sign_auth_data(self.inner.signer.as_ref(), &mut auth_data)?;

        debug!(public_key = %auth_data.public_key.to_base64(), "Prepared a new backup version");

        Ok(BackupCreationInfo { auth_data, decryption_key })
    }

    /// Upload a new backup version and start uploading room keys to it.
    ///
    /// The backup state has to be known, a currently enabled backup gets
    /// disabled first. All room keys are marked as not backed up.
    #[instrument(skip_all)]
    pub async fn create_and_enable(
        &self,
        creation_info: &BackupCreationInfo,
    ) -> Result<BackupVersionInfo, KeyBackupError> {
        let _guard = self.inner.modify_lock.lock().await;

        match self.state() {
            BackupState::Unknown | BackupState::CheckingBackup => {
                return Err(KeyBackupError::InvariantViolation(
                    "the backup state needs to be checked before a backup version can be created",
                ));
            }
            BackupState::Enabling => {
                return Err(KeyBackupError::InvariantViolation(
                    "a backup version is already being enabled",
                ));
            }
            BackupState::Disabled => {}
            BackupState::ReadyToBackUp | BackupState::WillBackUp | BackupState::BackingUp => {
                info!("Disabling the current backup version before creating a new one");
                self.disable_locked().await?;
            }
        }

        self.inner.state.set_state(BackupState::Enabling);

        match self.create_version(creation_info).await {
            Ok(version) => {
                info!(version = %version.version, "Created a new backup version");
                self.maybe_send_key_backup();

                Ok(version)
            }
            Err(e) => {
                warn!("Couldn't create a new backup version: {e:?}");
                self.inner.state.set_state(BackupState::Disabled);

                Err(e)
            }
        }
    }

    async fn create_version(
        &self,
        creation_info: &BackupCreationInfo,
    ) -> Result<BackupVersionInfo, KeyBackupError> {
        // The markers of the old version are meaningless for the new one.
        self.inner.store.reset_backup_state().await?;

        let info = creation_info.backup_info();
        let version = self.inner.service.create_version(info.clone()).await?;
        let version = BackupVersionInfo::new(version, info);

        let key = BackupEncryptionKey::from_auth_data(creation_info.auth_data());

        let _upload = self.inner.upload_lock.lock().await;
        self.activate(version.clone(), key);
        self.inner.state.set_state(BackupState::ReadyToBackUp);

        Ok(version)
    }

    /// Ask the backup service for the latest backup version and enable
    /// backups if it was created by this device.
    ///
    /// Only does something in the [`BackupState::Unknown`] state, returns the
    /// resulting state.
    #[instrument(skip_all)]
    pub async fn check_and_start_key_backup(&self) -> Result<BackupState, KeyBackupError> {
        let _guard = self.inner.modify_lock.lock().await;

        if !self.inner.state.transition(BackupState::Unknown, BackupState::CheckingBackup) {
            let state = self.state();
            debug!(?state, "The backup state is already known");

            return Ok(state);
        }

        let version = match self.get_version(None).await {
            Ok(version) => version,
            Err(e) => {
                warn!("Couldn't check if a backup exists: {e:?}");
                self.inner.state.set_state(BackupState::Unknown);

                return Err(e);
            }
        };

        let Some(version) = version else {
            info!("No backup version exists on the server");
            self.inner.state.set_state(BackupState::Disabled);

            return Ok(self.state());
        };

        let signature_state = self.verify_backup(&version);

        let key = version
            .info
            .megolm_v1_auth_data()
            .ok()
            .filter(|_| signature_state.trusted())
            .map(BackupEncryptionKey::from_auth_data);

        if let Some(key) = key {
            info!(version = %version.version, "Found a trusted backup, enabling backups");

            {
                let _upload = self.inner.upload_lock.lock().await;
                self.activate(version, key);
                self.inner.state.set_state(BackupState::ReadyToBackUp);
            }

            self.maybe_send_key_backup();
        } else {
            info!(
                version = %version.version,
                ?signature_state,
                "The backup version on the server isn't trusted, backups stay disabled"
            );
            self.inner.state.set_state(BackupState::Disabled);
        }

        Ok(self.state())
    }

    /// Enable an existing backup version using its recovery key.
    ///
    /// Returns `false`, and leaves backups disabled, if the recovery key
    /// doesn't belong to the version.
    #[instrument(skip(self, version, recovery_key), fields(version = %version.version))]
    pub async fn enable_with_recovery_key(
        &self,
        version: &BackupVersionInfo,
        recovery_key: &str,
    ) -> Result<bool, KeyBackupError> {
        let decryption_key =
            BackupDecryptionKey::from_base58(recovery_key).map_err(RecoveryKeyError::from)?;
        let auth_data = version.info.megolm_v1_auth_data()?;

        let _guard = self.inner.modify_lock.lock().await;

        if self.state() != BackupState::Disabled {
            return Err(KeyBackupError::InvariantViolation(
                "an existing backup version can only be enabled while backups are disabled",
            ));
        }

        self.inner.state.set_state(BackupState::Enabling);

        if decryption_key.backup_key_matches(auth_data) {
            {
                let _upload = self.inner.upload_lock.lock().await;
                self.activate(version.clone(), decryption_key.encryption_key());
                self.inner.state.set_state(BackupState::ReadyToBackUp);
            }

            info!("Backups have been enabled");
            self.maybe_send_key_backup();

            Ok(true)
        } else {
            info!("The recovery key doesn't match the backup version, backups stay disabled");
            self.inner.state.set_state(BackupState::Disabled);

            Ok(false)
        }
    }

    /// Stop uploading room keys, the backup version on the server is kept.
    #[instrument(skip_all)]
    pub async fn disable(&self) -> Result<(), KeyBackupError> {
        let _guard = self.inner.modify_lock.lock().await;
        self.disable_locked().await?;

        info!("Backups have been disabled");

        Ok(())
    }

    /// Delete a backup version from the server.
    ///
    /// If it's the version room keys are uploaded to, backups get disabled
    /// first.
    #[instrument(skip(self))]
    pub async fn delete_version(&self, version: &str) -> Result<(), KeyBackupError> {
        let _guard = self.inner.modify_lock.lock().await;

        if self.current_version().is_some_and(|v| v.version == version) {
            info!("Deleting the active backup version, disabling backups");
            self.disable_locked().await?;
        }

        self.inner.service.delete_version(version).await?;

        Ok(())
    }

    /// Must be called with the upload lock held.
    fn activate(&self, version: BackupVersionInfo, key: BackupEncryptionKey) {
        *self.inner.active.write().unwrap() = Some(ActiveBackup { version, key });
    }

    async fn disable_locked(&self) -> Result<(), KeyBackupError> {
        let _upload = self.inner.upload_lock.lock().await;
        self.reset_active_backup().await
    }

    /// Must be called with the upload lock held.
    async fn reset_active_backup(&self) -> Result<(), KeyBackupError> {
        self.inner.active.write().unwrap().take();

        let result = self.inner.store.reset_backup_state().await;
        self.inner.state.set_state(BackupState::Disabled);

        Ok(result?)
    }

    /// Schedule an upload of the room keys that aren't backed up yet.
    ///
    /// Only does something in the [`BackupState::ReadyToBackUp`] state, the
    /// upload starts after a random delay.
    pub fn maybe_send_key_backup(&self) {
        if self.inner.state.transition(BackupState::ReadyToBackUp, BackupState::WillBackUp) {
            let delay = self.inner.upload_delay.next_delay(self.inner.settings.max_upload_delay);
            debug!(?delay, "Scheduling an upload of room keys");

            self.inner.upload_task.trigger_upload(delay);
        } else {
            trace!(state = ?self.state(), "Not scheduling an upload of room keys");
        }
    }

    /// Upload room keys in chunks until every room key is backed up.
    pub(crate) async fn send_key_backup(&self) -> Result<(), KeyBackupError> {
        loop {
            let mut guard = Some(self.inner.upload_lock.lock().await);

            let state = self.state();

            if state != BackupState::WillBackUp {
                trace!(?state, "No upload is scheduled, not uploading room keys");
                return Ok(());
            }

            let Some(active) = self.active_backup() else {
                warn!("An upload is scheduled but no backup version is enabled");

                return Err(KeyBackupError::InvariantViolation(
                    "room keys can only be uploaded while a backup version is enabled",
                ));
            };

            if !self.inner.state.transition(BackupState::WillBackUp, BackupState::BackingUp) {
                return Ok(());
            }

            match self.upload_next_chunk(&active, &mut guard).await {
                Ok(ChunkUpload::MoreKeys) => {
                    self.inner.state.transition(BackupState::BackingUp, BackupState::WillBackUp);
                }
                Ok(ChunkUpload::Done) => {
                    self.inner.state.transition(BackupState::BackingUp, BackupState::ReadyToBackUp);
                    return Ok(());
                }
                Ok(ChunkUpload::Interrupted) => {
                    debug!(
                        version = %active.version.version,
                        state = ?self.state(),
                        "The backup changed while waiting to retry, stopping the upload"
                    );
                    return Ok(());
                }
                Err(e) => {
                    let _ = self.inner.upload_failures.send(());

                    if e.server_error_kind().is_some_and(ErrorKind::is_version_gone) {
                        warn!(
                            version = %active.version.version,
                            "The backup version got deleted or replaced, disabling backups"
                        );
                        self.reset_active_backup().await?;
                    } else {
                        self.inner
                            .state
                            .transition(BackupState::BackingUp, BackupState::ReadyToBackUp);
                    }

                    return Err(e);
                }
            }
        }
    }

    /// Upload the next chunk of room keys.
    ///
    /// The upload lock in `guard` is released while waiting to retry a failed
    /// request and held again whenever this returns.
    async fn upload_next_chunk<'a>(
        &'a self,
        active: &ActiveBackup,
        guard: &mut Option<MutexGuard<'a, ()>>,
    ) -> Result<ChunkUpload, KeyBackupError> {
        let batch_size = self.inner.settings.batch_size;
        let sessions = self.inner.store.sessions_for_backup(batch_size).await?;

        if sessions.is_empty() {
            trace!("No room keys need to be backed up");
            return Ok(ChunkUpload::Done);
        }

        let mut rooms = BackupBlob::new();

        for session in &sessions {
            let data = active.key.encrypt(self.inner.crypto.as_ref(), session)?;

            rooms
                .entry(session.room_id.clone())
                .or_default()
                .sessions
                .insert(session.session_id.clone(), data);
        }

        trace!(
            version = %active.version.version,
            count = sessions.len(),
            "Uploading a chunk of room keys"
        );

        if !self.put_room_keys(active, rooms, guard).await? {
            return Ok(ChunkUpload::Interrupted);
        }

        let session_ids: Vec<_> =
            sessions.iter().map(|s| (s.sender_key.as_str(), s.session_id.as_str())).collect();
        self.inner.store.mark_as_backed_up(&session_ids).await?;

        Ok(if sessions.len() >= batch_size { ChunkUpload::MoreKeys } else { ChunkUpload::Done })
    }

    /// Upload a chunk of room keys, retrying transient failures.
    ///
    /// Returns `false` if the backup got disabled or replaced while we were
    /// waiting to retry, nothing was uploaded in that case.
    async fn put_room_keys<'a>(
        &'a self,
        active: &ActiveBackup,
        rooms: BackupBlob,
        guard: &mut Option<MutexGuard<'a, ()>>,
    ) -> Result<bool, ServiceError> {
        let settings = &self.inner.settings;
        let version = active.version.version.as_str();
        let mut attempt = 0;

        loop {
            match self.inner.service.put_room_keys(version, rooms.clone()).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_transient() && attempt < settings.upload_retry_limit => {
                    let retry_after = match e.kind() {
                        Some(ErrorKind::LimitExceeded { retry_after }) => *retry_after,
                        _ => None,
                    };
                    let delay = settings.retry_delay(attempt, retry_after);

                    debug!(attempt, ?delay, "Uploading room keys failed, retrying: {e}");

                    // Backups can be disabled or replaced while we wait.
                    guard.take();
                    tokio::time::sleep(delay).await;
                    *guard = Some(self.inner.upload_lock.lock().await);

                    if self.state() != BackupState::BackingUp
                        || !self.current_version().is_some_and(|v| v.version == version)
                    {
                        return Ok(false);
                    }

                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Upload every room key that isn't backed up yet and wait for it to
    /// finish.
    pub fn backup_all_group_sessions(&self) -> BackupAllGroupSessions<'_> {
        BackupAllGroupSessions { backups: self, progress: ChannelObservable::default() }
    }

    /// Download room keys from a backup and import them into the store.
    ///
    /// With a room id and a session id a single room key is restored, with
    /// only a room id all room keys of the room, otherwise all room keys of
    /// the backup. Room keys that fail to decrypt are skipped.
    ///
    /// Restored room keys count as backed up if `version` is the version
    /// room keys are uploaded to, otherwise they get uploaded to it.
    #[instrument(skip(self, version, recovery_key), fields(version = %version.version))]
    pub async fn restore_key_backup(
        &self,
        version: &BackupVersionInfo,
        recovery_key: &str,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<RoomKeyImportResult, KeyBackupError> {
        let decryption_key =
            BackupDecryptionKey::from_base58(recovery_key).map_err(RecoveryKeyError::from)?;

        self.restore_with_key(version, &decryption_key, room_id, session_id).await
    }

    /// Like [`Backups::restore_key_backup`], for backups whose private key
    /// was derived from a passphrase.
    #[instrument(skip(self, version, passphrase), fields(version = %version.version))]
    pub async fn restore_key_backup_with_passphrase(
        &self,
        version: &BackupVersionInfo,
        passphrase: &str,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<RoomKeyImportResult, KeyBackupError> {
        let auth_data = version.info.megolm_v1_auth_data()?;
        let (salt, iterations) =
            auth_data.passphrase_info().ok_or(ProtocolError::MissingPassphraseInfo)?;

        let decryption_key =
            derive_key_from_passphrase(passphrase, salt.to_owned(), iterations).await?;

        self.restore_with_key(version, &decryption_key, room_id, session_id).await
    }

    async fn restore_with_key(
        &self,
        version: &BackupVersionInfo,
        decryption_key: &BackupDecryptionKey,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<RoomKeyImportResult, KeyBackupError> {
        let auth_data = version.info.megolm_v1_auth_data()?;

        if !decryption_key.backup_key_matches(auth_data) {
            return Err(RecoveryKeyError::KeyMismatch.into());
        }

        let rooms = self.download_room_keys(&version.version, room_id, session_id).await?;

        let mut total_count = 0;
        let mut sessions = Vec::new();

        for (room_id, room) in &rooms {
            for (session_id, entry) in &room.sessions {
                total_count += 1;

                let crypto = self.inner.crypto.as_ref();

                match decryption_key.decrypt_room_key(crypto, room_id, session_id, entry) {
                    Ok(session) => sessions.push(session),
                    Err(e) => debug!(
                        %room_id,
                        %session_id,
                        "Skipping a room key that can't be decrypted: {e}"
                    ),
                }
            }
        }

        let is_current_version =
            self.current_version().is_some_and(|v| v.version == version.version);
        let imported_count = self.inner.store.import_sessions(sessions, is_current_version).await?;

        info!(total_count, imported_count, "Restored room keys from the backup");

        if !is_current_version && imported_count > 0 {
            self.maybe_send_key_backup();
        }

        Ok(RoomKeyImportResult::new(imported_count, total_count))
    }

    async fn download_room_keys(
        &self,
        version: &str,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<BackupBlob, ServiceError> {
        let service = &self.inner.service;

        Ok(match (room_id, session_id) {
            (Some(room_id), Some(session_id)) => {
                match service.get_room_key(version, room_id, session_id).await {
                    Ok(entry) => BackupBlob::from([(
                        room_id.to_owned(),
                        RoomKeyBackup {
                            sessions: BTreeMap::from([(session_id.to_owned(), entry)]),
                        },
                    )]),
                    Err(ServiceError::Server(ErrorKind::NotFound)) => BackupBlob::new(),
                    Err(e) => return Err(e),
                }
            }
            (Some(room_id), None) => BackupBlob::from([(
                room_id.to_owned(),
                service.get_room_keys_for_room(version, room_id).await?,
            )]),
            (None, session_id) => {
                let mut rooms = service.get_room_keys(version).await?;

                if let Some(session_id) = session_id {
                    for room in rooms.values_mut() {
                        room.sessions.retain(|id, _| id == session_id);
                    }

                    rooms.retain(|_, room| !room.sessions.is_empty());
                }

                rooms
            }
        })
    }
}

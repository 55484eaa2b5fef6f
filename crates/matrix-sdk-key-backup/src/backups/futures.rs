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

use std::{future::IntoFuture, pin::Pin};

use futures_core::{Future, Stream};
use thiserror::Error;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::trace;

use super::Backups;
use crate::{
    observable::ChannelObservable, state::BackupStateMachine, store::CryptoStoreError,
    types::RoomKeyCounts, BackupState, StateListenerHandle,
};

/// Error type for [`BackupAllGroupSessions`].
#[derive(Debug, Error)]
pub enum BackupAllError {
    /// The backup got disabled, or never was enabled.
    #[error("The backup got disabled while waiting for the room keys to be uploaded.")]
    BackupDisabled,
    /// Uploading the room keys failed.
    #[error("The room keys couldn't be uploaded.")]
    Upload,
    /// The room key counts couldn't be read.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Future that uploads every room key that isn't backed up yet.
///
/// The progress, as [`RoomKeyCounts`], can be followed with
/// [`BackupAllGroupSessions::subscribe_to_progress`]. The future resolves once
/// the upload task ran out of room keys to upload.
#[derive(Debug)]
pub struct BackupAllGroupSessions<'a> {
    pub(super) backups: &'a Backups,
    pub(super) progress: ChannelObservable<RoomKeyCounts>,
}

impl BackupAllGroupSessions<'_> {
    /// Subscribe to the progress of the upload, every item contains the room
    /// key counts of the store.
    pub fn subscribe_to_progress(
        &self,
    ) -> impl Stream<Item = Result<RoomKeyCounts, BroadcastStreamRecvError>> {
        self.progress.subscribe()
    }
}

/// Removes a state listener once dropped.
struct ListenerGuard<'a> {
    state: &'a BackupStateMachine,
    handle: StateListenerHandle,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.state.remove_listener(self.handle);
    }
}

impl<'a> IntoFuture for BackupAllGroupSessions<'a> {
    type Output = Result<(), BackupAllError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let Self { backups, progress } = self;

            let counts = backups.room_key_counts().await?;
            progress.set(counts);

            if counts.is_complete() {
                trace!(?counts, "All room keys are already backed up");
                return Ok(());
            }

            if !backups.is_enabled() {
                return Err(BackupAllError::BackupDisabled);
            }

            // Subscribe to both the upload failures and the states before the
            // upload gets triggered, so nothing gets lost in between.
            let mut failures = backups.inner.upload_failures.subscribe();
            let (sender, mut states) = mpsc::unbounded_channel();

            let state_machine = &backups.inner.state;
            let _guard = ListenerGuard {
                state: state_machine,
                handle: state_machine.add_listener(move |state| {
                    let _ = sender.send(state);
                }),
            };

            backups.maybe_send_key_backup();

            loop {
                tokio::select! {
                    // A failed upload is published before the state goes back to
                    // `ReadyToBackUp`, check the failures first so the failure
                    // isn't mistaken for a successful upload.
                    biased;

                    failure = failures.recv() => match failure {
                        Ok(()) | Err(RecvError::Lagged(_)) => return Err(BackupAllError::Upload),
                        Err(RecvError::Closed) => return Err(BackupAllError::BackupDisabled),
                    },

                    state = states.recv() => {
                        let Some(state) = state else {
                            return Err(BackupAllError::BackupDisabled);
                        };

                        let counts = backups.room_key_counts().await?;
                        trace!(?state, ?counts, "Backup state changed while uploading room keys");
                        progress.set(counts);

                        match state {
                            BackupState::ReadyToBackUp => return Ok(()),
                            BackupState::Disabled | BackupState::Unknown => {
                                return Err(BackupAllError::BackupDisabled)
                            }
                            _ => (),
                        }
                    }
                }
            }
        })
    }
}

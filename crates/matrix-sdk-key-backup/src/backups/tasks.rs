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

use std::{sync::Weak, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{trace, warn};

use super::{Backups, BackupsInner};

/// The background task that uploads room keys.
///
/// Every trigger carries the delay to wait before the upload starts. Uploads
/// run one after the other, never concurrently.
pub(crate) struct BackupUploadingTask {
    sender: mpsc::UnboundedSender<Duration>,
    join_handle: JoinHandle<()>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for BackupUploadingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupUploadingTask").finish_non_exhaustive()
    }
}

impl Drop for BackupUploadingTask {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

impl BackupUploadingTask {
    pub(crate) fn new(backups: Weak<BackupsInner>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let join_handle = tokio::spawn(async move {
            Self::listen(backups, receiver).await;
        });

        Self { sender, join_handle }
    }

    pub(crate) fn trigger_upload(&self, delay: Duration) {
        let _ = self.sender.send(delay);
    }

    async fn listen(backups: Weak<BackupsInner>, mut receiver: mpsc::UnboundedReceiver<Duration>) {
        while let Some(delay) = receiver.recv().await {
            tokio::time::sleep(delay).await;

            let Some(inner) = backups.upgrade() else {
                trace!("The backups got dropped, shutting down the task");
                break;
            };

            if let Err(e) = (Backups { inner }).send_key_backup().await {
                warn!("Error backing up room keys {e:?}");
            }
        }
    }
}

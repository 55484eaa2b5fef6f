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

//! Configuration of the backup uploads.

use std::{fmt::Debug, time::Duration};

use rand::{thread_rng, Rng};

/// The default upper bound of the delay before room keys get uploaded.
pub const DEFAULT_MAX_UPLOAD_DELAY: Duration = Duration::from_secs(10);

/// The default number of room keys that get uploaded in a single request.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// The default upper bound of the delay before a failed upload is retried.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// The default number of PBKDF2 rounds used for passphrase protected backups.
pub const DEFAULT_PASSPHRASE_ITERATIONS: u32 = 500_000;

/// Settings for the room key uploads of the backup.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use matrix_sdk_key_backup::config::BackupSettings;
///
/// // Upload keys in batches of 50 and retry failed uploads twice.
/// let settings = BackupSettings::new().batch_size(50).upload_retry_limit(2);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct BackupSettings {
    pub(crate) max_upload_delay: Duration,
    pub(crate) batch_size: usize,
    pub(crate) upload_retry_limit: u32,
    pub(crate) upload_retry_backoff: Duration,
    pub(crate) max_retry_delay: Duration,
    pub(crate) passphrase_iterations: u32,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            max_upload_delay: DEFAULT_MAX_UPLOAD_DELAY,
            batch_size: DEFAULT_BATCH_SIZE,
            upload_retry_limit: 0,
            upload_retry_backoff: Duration::from_secs(1),
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            passphrase_iterations: DEFAULT_PASSPHRASE_ITERATIONS,
        }
    }
}

impl BackupSettings {
    /// Create a new default `BackupSettings`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// The upper bound of the random delay between a new room key becoming
    /// available and the start of the upload. The default is 10 seconds.
    #[must_use]
    pub fn max_upload_delay(mut self, delay: Duration) -> Self {
        self.max_upload_delay = delay;
        self
    }

    /// The number of room keys uploaded in a single request. The default is
    /// 100, zero is treated as one.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// How many times an upload that failed with a transient error is
    /// retried. The default is not to retry.
    #[must_use]
    pub fn upload_retry_limit(mut self, retry_limit: u32) -> Self {
        self.upload_retry_limit = retry_limit;
        self
    }

    /// The delay before the first retry of a failed upload, it doubles with
    /// every further retry.
    #[must_use]
    pub fn upload_retry_backoff(mut self, backoff: Duration) -> Self {
        self.upload_retry_backoff = backoff;
        self
    }

    /// The upper bound of the delay before a failed upload is retried. This
    /// caps the backoff as well as delays the backup service asks for when
    /// rate limiting us. The default is 60 seconds.
    #[must_use]
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// The number of PBKDF2 rounds used when a new backup is protected by a
    /// passphrase.
    #[must_use]
    pub fn passphrase_iterations(mut self, iterations: u32) -> Self {
        self.passphrase_iterations = iterations;
        self
    }

    /// The delay before the given retry, `retry_after` is the delay the backup
    /// service asked for.
    pub(crate) fn retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or_else(|| {
                self.upload_retry_backoff.saturating_mul(2u32.saturating_pow(attempt))
            })
            .min(self.max_retry_delay)
    }
}

/// Source of the delay between a new room key becoming available and the
/// start of the upload.
pub trait UploadDelay: Debug + Send + Sync {
    /// Pick a delay that is smaller than `max`, or zero if `max` is zero.
    fn next_delay(&self, max: Duration) -> Duration;
}

/// Picks a uniformly distributed random delay, spreading the uploads of many
/// devices over time.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomUploadDelay;

impl UploadDelay for RandomUploadDelay {
    fn next_delay(&self, max: Duration) -> Duration {
        let max = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);

        if max == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(thread_rng().gen_range(0..max))
        }
    }
}

/// Always uses the same delay, capped by the maximum.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedUploadDelay(pub Duration);

impl UploadDelay for FixedUploadDelay {
    fn next_delay(&self, max: Duration) -> Duration {
        self.0.min(max)
    }
}

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
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex as StdMutex,
    },
    thread::{self, ThreadId},
};

use futures_core::Stream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{trace, warn};

use crate::observable::ChannelObservable;

/// The lifecycle state of the backup.
///
/// The valid transitions are:
///
/// ```text
/// Unknown        -> CheckingBackup
/// CheckingBackup -> Disabled | ReadyToBackUp | Unknown
/// Disabled       -> Enabling
/// Enabling       -> ReadyToBackUp | Disabled
/// ReadyToBackUp  -> WillBackUp
/// WillBackUp     -> BackingUp
/// BackingUp      -> ReadyToBackUp | WillBackUp
/// ```
///
/// Every state can additionally move to [`BackupState::Disabled`] when the
/// backup is disabled or deleted and to [`BackupState::Unknown`] on an
/// unrecoverable error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BackupState {
    /// We don't know yet if a backup exists, the initial state.
    #[default]
    Unknown,
    /// We're asking the backup service for the latest backup version.
    CheckingBackup,
    /// There is no usable backup, or it was disabled.
    Disabled,
    /// A backup version is being created or enabled.
    Enabling,
    /// The backup is enabled and nothing is waiting to be uploaded.
    ReadyToBackUp,
    /// An upload of room keys is scheduled.
    WillBackUp,
    /// Room keys are being uploaded.
    BackingUp,
}

impl BackupState {
    /// Are room keys uploaded to the backup in this state.
    pub fn is_enabled(self) -> bool {
        matches!(
            self,
            BackupState::ReadyToBackUp | BackupState::WillBackUp | BackupState::BackingUp
        )
    }

    /// Is moving from this state to `next` a valid transition.
    pub fn can_transition_to(self, next: BackupState) -> bool {
        use BackupState::*;

        if self == next || matches!(next, Disabled | Unknown) {
            return true;
        }

        matches!(
            (self, next),
            (Unknown, CheckingBackup)
                | (CheckingBackup, ReadyToBackUp)
                | (Disabled, Enabling)
                | (Enabling, ReadyToBackUp)
                | (ReadyToBackUp, WillBackUp)
                | (WillBackUp, BackingUp)
                | (BackingUp, ReadyToBackUp)
                | (BackingUp, WillBackUp)
        )
    }
}

type StateListener = Arc<dyn Fn(BackupState) + Send + Sync>;

/// A handle to a state listener, used to remove it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StateListenerHandle(u64);

/// Holds the [`BackupState`] and notifies listeners about every assignment.
///
/// Listeners are called synchronously after the new state was stored, with
/// the new state as the argument, before the assignment returns. Assigning
/// the state a value it already has notifies the listeners as well.
///
/// Listeners see the assignments in the order they were stored, even if
/// several threads assign states at the same time: only one thread calls the
/// listeners at a time and the others wait until their assignment was
/// delivered. An assignment made by a listener is delivered once the current
/// round of listeners returned.
pub struct BackupStateMachine {
    state: ChannelObservable<BackupState>,
    listeners: StdMutex<Vec<(StateListenerHandle, StateListener)>>,
    next_listener_id: AtomicU64,
    /// Held while a state is stored and queued for the listeners.
    notifications: StdMutex<Notifications>,
    delivered: Condvar,
}

#[derive(Debug, Default)]
struct Notifications {
    pending: VecDeque<(u64, BackupState, BackupState)>,
    last_queued: u64,
    last_delivered: u64,
    /// The thread currently calling the listeners.
    deliverer: Option<ThreadId>,
}

impl Notifications {
    fn enqueue(&mut self, old_state: BackupState, new_state: BackupState) -> u64 {
        self.last_queued += 1;
        self.pending.push_back((self.last_queued, old_state, new_state));

        self.last_queued
    }
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for BackupStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupStateMachine")
            .field("state", &self.state())
            .field("listeners", &self.listeners.lock().unwrap().len())
            .finish()
    }
}

impl Default for BackupStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupStateMachine {
    /// Create a new state machine in the [`BackupState::Unknown`] state.
    pub fn new() -> Self {
        Self {
            state: ChannelObservable::new(BackupState::Unknown),
            listeners: Default::default(),
            next_listener_id: AtomicU64::new(0),
            notifications: Default::default(),
            delivered: Condvar::new(),
        }
    }

    /// The current state.
    pub fn state(&self) -> BackupState {
        self.state.get()
    }

    /// Subscribe to state changes, the current state is the first item of the
    /// stream.
    pub fn subscribe(&self) -> impl Stream<Item = Result<BackupState, BroadcastStreamRecvError>> {
        self.state.subscribe()
    }

    /// Add a listener that gets called on every state assignment.
    pub fn add_listener(
        &self,
        listener: impl Fn(BackupState) + Send + Sync + 'static,
    ) -> StateListenerHandle {
        let handle = StateListenerHandle(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().unwrap().push((handle, Arc::new(listener)));

        handle
    }

    /// Remove a listener, returns false if it was already removed.
    ///
    /// This may be called from within a listener.
    pub fn remove_listener(&self, handle: StateListenerHandle) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let count = listeners.len();
        listeners.retain(|(h, _)| *h != handle);

        listeners.len() != count
    }

    /// Assign a new state unconditionally.
    pub(crate) fn set_state(&self, new_state: BackupState) {
        let id = {
            let mut notifications = self.notifications.lock().unwrap();
            let old_state = self.state();

            if !old_state.can_transition_to(new_state) {
                warn!(?old_state, ?new_state, "Invalid backup state transition");
            }

            self.state.set(new_state);
            notifications.enqueue(old_state, new_state)
        };

        self.deliver(id);
    }

    /// Assign a new state only if the current state is `expected`.
    pub(crate) fn transition(&self, expected: BackupState, new_state: BackupState) -> bool {
        let id = {
            let mut notifications = self.notifications.lock().unwrap();

            self.state
                .set_if(|current| *current == expected, new_state)
                .then(|| notifications.enqueue(expected, new_state))
        };

        match id {
            Some(id) => {
                self.deliver(id);
                true
            }
            None => false,
        }
    }

    /// Call the listeners for every queued assignment up to and including
    /// `id`, or wait until another thread did so.
    fn deliver(&self, id: u64) {
        let this_thread = thread::current().id();
        let mut notifications = self.notifications.lock().unwrap();

        loop {
            if notifications.last_delivered >= id {
                return;
            }

            match notifications.deliverer {
                // Assigned by a listener, the delivery further up the stack
                // picks it up.
                Some(deliverer) if deliverer == this_thread => return,
                Some(_) => notifications = self.delivered.wait(notifications).unwrap(),
                None => break,
            }
        }

        notifications.deliverer = Some(this_thread);
        let _guard = DeliveringGuard(self);

        loop {
            let Some((id, old_state, new_state)) = notifications.pending.pop_front() else {
                break;
            };
            drop(notifications);

            trace!(?old_state, ?new_state, "Backup state changed");

            // Listeners may add or remove listeners, so don't hold the lock
            // while calling them.
            let listeners: Vec<_> =
                self.listeners.lock().unwrap().iter().map(|(_, l)| l.clone()).collect();

            for listener in listeners {
                listener(new_state);
            }

            notifications = self.notifications.lock().unwrap();
            notifications.last_delivered = id;
            self.delivered.notify_all();
        }

        notifications.deliverer = None;
        self.delivered.notify_all();
    }
}

/// Lets another thread take over the delivery if a listener panicked.
struct DeliveringGuard<'a>(&'a BackupStateMachine);

impl Drop for DeliveringGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            if let Ok(mut notifications) = self.0.notifications.lock() {
                notifications.deliverer = None;
            }

            self.0.delivered.notify_all();
        }
    }
}

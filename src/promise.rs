// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Timed, single-delivery rendezvous on Redis Pub/Sub channels.
//!
//! A [`PromiseSubscription`] layers promises on top of a pattern subscription
//! for `prefix + "*"`: creating a [`Promise`] never sends a command to Redis,
//! it only registers a completion slot keyed by the channel suffix. The first
//! message published on `prefix + suffix` resolves every promise pending for
//! that suffix; a promise that is not resolved before its deadline times out,
//! and a disconnection or subscription close cancels it.

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use ahash::AHashMap;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::{
    sync::{oneshot, watch},
    time::Instant,
};

use crate::{error::MultiplexerError, subscription::PatternSubscription};

/// The activation state of a promise subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ActivationState {
    Inactive,
    Active,
    Closed,
}

/// Lifecycle snapshot published to waiters. The disconnect counter lets a
/// waiter observe a disconnection event even when no state transition is
/// visible (the subscription may already have been inactive).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Lifecycle {
    state: ActivationState,
    disconnects: u64,
}

/// Shared state of a promise subscription.
#[derive(Debug)]
pub(crate) struct PromiseState {
    pub(crate) id: u64,
    prefix: Bytes,
    lifecycle: watch::Sender<Lifecycle>,
    /// Pending completion slots keyed by channel suffix, in insertion order.
    pending: Mutex<AHashMap<Bytes, Vec<oneshot::Sender<Bytes>>>>,
}

impl PromiseState {
    pub(crate) fn new(id: u64, prefix: Bytes) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle {
            state: ActivationState::Inactive,
            disconnects: 0,
        });
        Self {
            id,
            prefix,
            lifecycle,
            pending: Mutex::new(AHashMap::new()),
        }
    }

    pub(crate) fn prefix(&self) -> &Bytes {
        &self.prefix
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lifecycle.borrow().state == ActivationState::Active
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lifecycle.borrow().state == ActivationState::Closed
    }

    /// Resolves every promise pending for the suffix of `channel`.
    ///
    /// Messages without a pending promise are dropped.
    pub(crate) fn resolve(&self, channel: &Bytes, payload: &Bytes) {
        if !channel.starts_with(&self.prefix) {
            return;
        }
        let suffix = channel.slice(self.prefix.len()..);
        let senders = self.pending.lock().unwrap().remove(&suffix);
        let Some(senders) = senders else {
            return;
        };
        for sender in senders {
            // A send error means the awaiter already went away
            let _ = sender.send(payload.clone());
        }
    }

    /// Transitions to active, releasing activation waiters.
    pub(crate) fn activate(&self) {
        self.lifecycle.send_if_modified(|lifecycle| {
            if lifecycle.state == ActivationState::Inactive {
                lifecycle.state = ActivationState::Active;
                true
            } else {
                false
            }
        });
    }

    /// Handles a connection loss: transitions to inactive and cancels every
    /// pending promise. Activation waiters stay blocked until reactivation.
    pub(crate) fn handle_disconnect(&self) {
        self.lifecycle.send_modify(|lifecycle| {
            if lifecycle.state == ActivationState::Active {
                lifecycle.state = ActivationState::Inactive;
            }
            lifecycle.disconnects += 1;
        });
        self.cancel_pending();
    }

    /// Closes the subscription state, cancelling every pending promise and
    /// failing every waiter.
    pub(crate) fn close(&self) {
        let changed = self.lifecycle.send_if_modified(|lifecycle| {
            if lifecycle.state == ActivationState::Closed {
                false
            } else {
                lifecycle.state = ActivationState::Closed;
                true
            }
        });
        if changed {
            self.cancel_pending();
        }
    }

    /// Dropping the senders fails the paired receivers, which awaiters
    /// observe as cancellation.
    fn cancel_pending(&self) {
        self.pending.lock().unwrap().clear();
    }

    pub(crate) fn new_promise(
        &self,
        suffix: Bytes,
        timeout: Duration,
    ) -> Result<Promise, MultiplexerError> {
        let mut pending = self.pending.lock().unwrap();
        // Checked under the pending lock so creation is atomic with close
        match self.lifecycle.borrow().state {
            ActivationState::Closed => return Err(MultiplexerError::SubscriptionClosed),
            ActivationState::Inactive => return Err(MultiplexerError::InactiveSubscription),
            ActivationState::Active => {}
        }

        let (sender, receiver) = oneshot::channel();
        let slot = pending.entry(suffix).or_default();
        slot.retain(|existing| !existing.is_closed());
        slot.push(sender);

        Ok(Promise {
            receiver,
            deadline: Instant::now() + timeout,
        })
    }

    pub(crate) async fn wait_for_activation(&self) -> Result<(), MultiplexerError> {
        let mut lifecycle_rx = self.lifecycle.subscribe();
        loop {
            match lifecycle_rx.borrow_and_update().state {
                ActivationState::Active => return Ok(()),
                ActivationState::Closed => return Err(MultiplexerError::SubscriptionClosed),
                ActivationState::Inactive => {}
            }
            if lifecycle_rx.changed().await.is_err() {
                return Err(MultiplexerError::SubscriptionClosed);
            }
        }
    }

    pub(crate) async fn wait_for_new_promise(
        &self,
        suffix: Bytes,
        timeout: Duration,
    ) -> Result<Promise, MultiplexerError> {
        let mut lifecycle_rx = self.lifecycle.subscribe();
        let initial_disconnects = lifecycle_rx.borrow().disconnects;
        loop {
            let (state, disconnects) = {
                let lifecycle = lifecycle_rx.borrow_and_update();
                (lifecycle.state, lifecycle.disconnects)
            };
            if disconnects != initial_disconnects {
                return Err(MultiplexerError::Cancelled);
            }
            match state {
                ActivationState::Closed => return Err(MultiplexerError::SubscriptionClosed),
                ActivationState::Active => match self.new_promise(suffix.clone(), timeout) {
                    // Activation was lost between wake-up and creation; retry
                    Err(MultiplexerError::InactiveSubscription) => {}
                    result => return result,
                },
                ActivationState::Inactive => {}
            }
            if lifecycle_rx.changed().await.is_err() {
                return Err(MultiplexerError::SubscriptionClosed);
            }
        }
    }
}

/// A timed, single-use rendezvous with one future Pub/Sub message.
///
/// Awaiting a promise yields the payload of the first message published on
/// its channel after creation, [`MultiplexerError::TimedOut`] once the
/// deadline elapses, or [`MultiplexerError::Cancelled`] if the owning
/// subscription was closed or the connection was lost first. The deadline
/// clock starts when the promise is created, not when it is awaited.
/// Dropping an unawaited promise detaches it without affecting other
/// promises on the same suffix.
#[derive(Debug)]
pub struct Promise {
    receiver: oneshot::Receiver<Bytes>,
    deadline: Instant,
}

impl IntoFuture for Promise {
    type Output = Result<Bytes, MultiplexerError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            match tokio::time::timeout_at(self.deadline, self.receiver).await {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(_)) => Err(MultiplexerError::Cancelled),
                Err(_) => Err(MultiplexerError::TimedOut),
            }
        })
    }
}

/// A subscription producing timed, single-message promises under a fixed
/// channel prefix.
///
/// Internally this holds a [`PatternSubscription`] for `prefix + "*"`, so
/// fulfilling or expiring a promise never sends a subscribe or unsubscribe
/// command to Redis. Consider calling
/// [`wait_for_activation`](Self::wait_for_activation) after creating one.
pub struct PromiseSubscription {
    state: Arc<PromiseState>,
    inner: PatternSubscription,
}

impl PromiseSubscription {
    pub(crate) fn new(state: Arc<PromiseState>, inner: PatternSubscription) -> Self {
        Self { state, inner }
    }

    /// Returns the prefix this subscription was created with.
    #[must_use]
    pub fn prefix(&self) -> &Bytes {
        self.state.prefix()
    }

    /// Returns whether the underlying pattern is active in the current
    /// connection generation.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Returns whether the subscription has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Suspends the caller until the subscription becomes active.
    ///
    /// Returns immediately if already active. Any number of concurrent
    /// waiters are all released on activation.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionClosed` if the subscription closes while waiting.
    pub async fn wait_for_activation(&self) -> Result<(), MultiplexerError> {
        self.state.wait_for_activation().await
    }

    /// Creates a new [`Promise`] for the channel `prefix + suffix`.
    ///
    /// The underlying pattern subscription already receives every message
    /// under the prefix, so the promise is in effect as soon as this returns.
    /// The timeout clock starts immediately.
    ///
    /// # Errors
    ///
    /// Returns `InactiveSubscription` if the subscription is not currently
    /// active, or `SubscriptionClosed` if it has been closed.
    pub fn new_promise(
        &self,
        suffix: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Promise, MultiplexerError> {
        self.state.new_promise(suffix.into(), timeout)
    }

    /// Like [`new_promise`](Self::new_promise) but waits for the subscription
    /// to become active instead of failing with `InactiveSubscription`.
    ///
    /// The timeout clock starts only once the promise is created.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionClosed` if the subscription closes while waiting,
    /// or `Cancelled` if a disconnection event occurs first.
    pub async fn wait_for_new_promise(
        &self,
        suffix: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Promise, MultiplexerError> {
        self.state.wait_for_new_promise(suffix.into(), timeout).await
    }

    /// Closes the subscription.
    ///
    /// Cancels every pending promise, releases every waiter and closes the
    /// inner pattern subscription. Idempotent.
    pub fn close(&self) {
        self.state.close();
        self.inner.close();
        let mut registry = self.inner.registry.lock().unwrap();
        registry.unregister(self.state.id);
    }
}

impl fmt::Debug for PromiseSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseSubscription")
            .field("prefix", self.state.prefix())
            .field("active", &self.state.is_active())
            .field("closed", &self.state.is_closed())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn active_state() -> PromiseState {
        let state = PromiseState::new(1, Bytes::from_static(b"hello-"));
        state.activate();
        state
    }

    #[rstest]
    fn test_new_promise_while_inactive() {
        let state = PromiseState::new(1, Bytes::from_static(b"hello-"));
        let result = state.new_promise(Bytes::from_static(b"world"), Duration::from_secs(1));
        assert!(matches!(
            result,
            Err(MultiplexerError::InactiveSubscription)
        ));
    }

    #[tokio::test]
    async fn test_promise_resolves_with_payload() {
        let state = active_state();
        let promise = state
            .new_promise(Bytes::from_static(b"world"), Duration::from_secs(5))
            .unwrap();

        state.resolve(
            &Bytes::from_static(b"hello-world"),
            &Bytes::from_static(b"42"),
        );

        assert_eq!(promise.await, Ok(Bytes::from_static(b"42")));
    }

    #[tokio::test]
    async fn test_promises_with_same_suffix_all_resolve() {
        let state = active_state();
        let p1 = state
            .new_promise(Bytes::from_static(b"world"), Duration::from_secs(5))
            .unwrap();
        let p2 = state
            .new_promise(Bytes::from_static(b"world"), Duration::from_secs(5))
            .unwrap();

        state.resolve(
            &Bytes::from_static(b"hello-world"),
            &Bytes::from_static(b"broadcast"),
        );

        assert_eq!(p1.await, Ok(Bytes::from_static(b"broadcast")));
        assert_eq!(p2.await, Ok(Bytes::from_static(b"broadcast")));
    }

    #[tokio::test]
    async fn test_promise_ignores_other_suffixes() {
        let state = active_state();
        let promise = state
            .new_promise(Bytes::from_static(b"world"), Duration::from_millis(50))
            .unwrap();

        state.resolve(
            &Bytes::from_static(b"hello-other"),
            &Bytes::from_static(b"nope"),
        );

        assert_eq!(promise.await, Err(MultiplexerError::TimedOut));
    }

    #[tokio::test]
    async fn test_promise_times_out() {
        let state = active_state();
        let promise = state
            .new_promise(Bytes::from_static(b"nobody"), Duration::from_millis(100))
            .unwrap();

        let started = Instant::now();
        assert_eq!(promise.await, Err(MultiplexerError::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(95));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_promises() {
        let state = active_state();
        let promise = state
            .new_promise(Bytes::from_static(b"world"), Duration::from_secs(5))
            .unwrap();

        state.handle_disconnect();
        assert_eq!(promise.await, Err(MultiplexerError::Cancelled));

        // Reactivation restores promise creation
        assert!(!state.is_active());
        state.activate();
        assert!(
            state
                .new_promise(Bytes::from_static(b"world"), Duration::from_secs(5))
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_close_cancels_pending_promises() {
        let state = active_state();
        let promise = state
            .new_promise(Bytes::from_static(b"world"), Duration::from_secs(5))
            .unwrap();

        state.close();
        assert_eq!(promise.await, Err(MultiplexerError::Cancelled));
        assert_eq!(
            state
                .new_promise(Bytes::from_static(b"world"), Duration::from_secs(5))
                .unwrap_err(),
            MultiplexerError::SubscriptionClosed
        );
    }

    #[tokio::test]
    async fn test_dropped_promise_detaches_without_side_effects() {
        let state = active_state();
        let p1 = state
            .new_promise(Bytes::from_static(b"world"), Duration::from_secs(5))
            .unwrap();
        let p2 = state
            .new_promise(Bytes::from_static(b"world"), Duration::from_secs(5))
            .unwrap();
        drop(p1);

        state.resolve(
            &Bytes::from_static(b"hello-world"),
            &Bytes::from_static(b"still-works"),
        );
        assert_eq!(p2.await, Ok(Bytes::from_static(b"still-works")));
    }

    #[tokio::test]
    async fn test_wait_for_activation_releases_all_waiters() {
        let state = Arc::new(PromiseState::new(1, Bytes::from_static(b"hello-")));

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let state = state.clone();
            waiters.push(tokio::spawn(
                async move { state.wait_for_activation().await },
            ));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        state.activate();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(()));
        }
    }

    #[tokio::test]
    async fn test_wait_for_activation_fails_on_close() {
        let state = Arc::new(PromiseState::new(1, Bytes::from_static(b"hello-")));

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_for_activation().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        state.close();
        assert_eq!(
            waiter.await.unwrap(),
            Err(MultiplexerError::SubscriptionClosed)
        );
    }

    #[tokio::test]
    async fn test_wait_for_new_promise_waits_for_activation() {
        let state = Arc::new(PromiseState::new(1, Bytes::from_static(b"hello-")));

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .wait_for_new_promise(Bytes::from_static(b"world"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        state.activate();
        let promise = waiter.await.unwrap().unwrap();

        state.resolve(
            &Bytes::from_static(b"hello-world"),
            &Bytes::from_static(b"late"),
        );
        assert_eq!(promise.await, Ok(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_wait_for_new_promise_cancelled_by_disconnect() {
        let state = Arc::new(PromiseState::new(1, Bytes::from_static(b"hello-")));

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .wait_for_new_promise(Bytes::from_static(b"world"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        state.handle_disconnect();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(MultiplexerError::Cancelled)
        ));
    }
}

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

//! Channel and pattern subscriptions.
//!
//! A [`ChannelSubscription`] ties one callback set to zero or more exact
//! Pub/Sub channels which can be added and removed over its lifetime. A
//! [`PatternSubscription`] ties one callback set to a single glob pattern
//! fixed at construction; pattern matching is performed server-side by Redis.
//!
//! Subscriptions hold a back-reference to the multiplexer registry and
//! actively unregister their interest on close.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use ahash::AHashSet;
use bytes::Bytes;

use crate::{
    callbacks::{OnActivation, OnDisconnect, OnMessage},
    error::MultiplexerError,
    multiplexer::Registry,
};

/// Shared state of a channel subscription, referenced by the registry's
/// refcount tables and by the public handle.
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub(crate) id: u64,
    pub(crate) on_message: Option<OnMessage>,
    pub(crate) on_disconnect: Option<OnDisconnect>,
    pub(crate) on_activation: Option<OnActivation>,
    /// The local set of channels this handle is interested in.
    pub(crate) channels: Mutex<AHashSet<Bytes>>,
    pub(crate) closed: AtomicBool,
}

impl ChannelState {
    pub(crate) fn new(
        id: u64,
        on_message: Option<OnMessage>,
        on_disconnect: Option<OnDisconnect>,
        on_activation: Option<OnActivation>,
    ) -> Self {
        Self {
            id,
            on_message,
            on_disconnect,
            on_activation,
            channels: Mutex::new(AHashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns whether this handle should currently receive messages for
    /// `channel`. Checked at delivery time so that a completed `remove`
    /// suppresses in-flight messages.
    pub(crate) fn is_interested(&self, channel: &Bytes) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.channels.lock().unwrap().contains(channel)
    }

    pub(crate) fn close(&self, registry: &mut Registry) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels: Vec<Bytes> = self.channels.lock().unwrap().drain().collect();
        for channel in &channels {
            registry.remove_channel(channel, self.id);
        }
        registry.unregister(self.id);
    }
}

/// Shared state of a pattern subscription.
#[derive(Debug)]
pub(crate) struct PatternState {
    pub(crate) id: u64,
    pub(crate) pattern: Bytes,
    pub(crate) on_message: Option<OnMessage>,
    pub(crate) on_disconnect: Option<OnDisconnect>,
    pub(crate) on_activation: Option<OnActivation>,
    pub(crate) closed: AtomicBool,
}

impl PatternState {
    pub(crate) fn new(
        id: u64,
        pattern: Bytes,
        on_message: Option<OnMessage>,
        on_disconnect: Option<OnDisconnect>,
        on_activation: Option<OnActivation>,
    ) -> Self {
        Self {
            id,
            pattern,
            on_message,
            on_disconnect,
            on_activation,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self, registry: &mut Registry) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        registry.remove_pattern(&self.pattern, self.id);
        registry.unregister(self.id);
    }
}

/// A subscription tying one callback set to zero or more exact Pub/Sub channels.
///
/// When created, a channel subscription is empty; channels are added with
/// [`ChannelSubscription::add`] and removed with
/// [`ChannelSubscription::remove`]. Use
/// [`Multiplexer::new_channel_subscription`](crate::multiplexer::Multiplexer::new_channel_subscription)
/// to create one, and call [`ChannelSubscription::close`] before disposing of it.
#[derive(Debug)]
pub struct ChannelSubscription {
    pub(crate) state: Arc<ChannelState>,
    pub(crate) registry: Arc<Mutex<Registry>>,
}

impl ChannelSubscription {
    /// Adds a Pub/Sub channel to the subscription.
    ///
    /// Adding a channel already present is a no-op: no duplicate callbacks and
    /// no second SUBSCRIBE on the wire. If the channel is already active in
    /// the current connection generation, the activation callback is scheduled
    /// asynchronously after this call returns.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionClosed` if this subscription or the multiplexer
    /// has been closed.
    pub fn add(&self, channel: impl Into<Bytes>) -> Result<(), MultiplexerError> {
        let channel: Bytes = channel.into();
        let mut registry = self.registry.lock().unwrap();
        if self.state.closed.load(Ordering::SeqCst) || registry.closed {
            return Err(MultiplexerError::SubscriptionClosed);
        }
        if !self.state.channels.lock().unwrap().insert(channel.clone()) {
            return Ok(());
        }
        registry.add_channel(channel, &self.state);
        Ok(())
    }

    /// Removes a Pub/Sub channel from the subscription.
    ///
    /// Removing an absent channel is a no-op. Once this returns, no further
    /// `on_message` is delivered for the channel on this handle, even if a
    /// message was already in flight.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionClosed` if this subscription or the multiplexer
    /// has been closed.
    pub fn remove(&self, channel: impl Into<Bytes>) -> Result<(), MultiplexerError> {
        let channel: Bytes = channel.into();
        let mut registry = self.registry.lock().unwrap();
        if self.state.closed.load(Ordering::SeqCst) || registry.closed {
            return Err(MultiplexerError::SubscriptionClosed);
        }
        if !self.state.channels.lock().unwrap().remove(&channel) {
            return Ok(());
        }
        registry.remove_channel(&channel, self.state.id);
        Ok(())
    }

    /// Returns a snapshot of the channels currently in the subscription.
    #[must_use]
    pub fn channels(&self) -> HashSet<Bytes> {
        self.state
            .channels
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect()
    }

    /// Returns whether the subscription has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Closes the subscription, removing every channel from the multiplexer.
    ///
    /// Subsequent `add`/`remove` calls fail with `SubscriptionClosed`.
    /// Idempotent.
    pub fn close(&self) {
        let mut registry = self.registry.lock().unwrap();
        self.state.close(&mut registry);
    }
}

/// A subscription tying one callback set to a single Pub/Sub glob pattern.
///
/// The pattern is fixed at construction and matched server-side with Redis
/// `PSUBSCRIBE` semantics; `on_message` receives the real channel name, not
/// the pattern. Once created, a pattern subscription can only be closed.
#[derive(Debug)]
pub struct PatternSubscription {
    pub(crate) state: Arc<PatternState>,
    pub(crate) registry: Arc<Mutex<Registry>>,
}

impl PatternSubscription {
    /// Returns the pattern this subscription was created with.
    #[must_use]
    pub fn pattern(&self) -> &Bytes {
        &self.state.pattern
    }

    /// Returns whether the subscription has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.state.is_live()
    }

    /// Closes the subscription, releasing its pattern interest. Idempotent.
    pub fn close(&self) {
        let mut registry = self.registry.lock().unwrap();
        self.state.close(&mut registry);
    }
}

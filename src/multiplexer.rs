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

//! The multiplexer core: reference-counted subscription bookkeeping, message
//! dispatch, and the reconnect loop.
//!
//! A [`Multiplexer`] corresponds to one Redis Pub/Sub connection shared by any
//! number of subscription instances. Subscriptions declare interest through
//! the registry; the registry issues (P)SUBSCRIBE on 0→1 refcount transitions
//! and (P)UNSUBSCRIBE on 1→0 transitions, so the connection only ever carries
//! channels some local subscriber still cares about. A controller task drives
//! the connection lifecycle: on failure it invalidates active state, notifies
//! every subscription, reconnects with exponential backoff, and re-declares
//! all current interest on the fresh connection.
//!
//! **Design**:
//! - One registry mutex covers both refcount tables, the activation marks,
//!   the generation counter and the current listener handle
//! - The lock is never held across an await or a subscriber callback
//! - Dispatch snapshots the target set under the lock and invokes outside it

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::{sync::watch, task::JoinHandle, time::sleep};

use crate::{
    backoff::ExponentialBackoff,
    callbacks::{OnActivation, OnDisconnect, OnMessage},
    config::MultiplexerConfig,
    error::MultiplexerError,
    listener::{Listener, ListenerEvent},
    promise::{PromiseState, PromiseSubscription},
    subscription::{ChannelState, ChannelSubscription, PatternState, PatternSubscription},
};

/// Produces a fresh [`Listener`] for every (re)connection attempt.
pub type ConnectionFactory =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Listener>> + Send + Sync>;

/// A weak registration of a live subscription, used for disconnect fan-out
/// and close-all.
#[derive(Debug)]
pub(crate) enum SubscriptionRef {
    Channel(Weak<ChannelState>),
    Pattern(Weak<PatternState>),
    Promise(Weak<PromiseState>),
}

impl SubscriptionRef {
    fn id(&self) -> Option<u64> {
        match self {
            Self::Channel(w) => w.upgrade().map(|s| s.id),
            Self::Pattern(w) => w.upgrade().map(|s| s.id),
            Self::Promise(w) => w.upgrade().map(|s| s.id),
        }
    }
}

/// An upgraded subscription reference held outside the registry lock while
/// delivering disconnect notifications.
enum DisconnectTarget {
    Channel(Arc<ChannelState>),
    Pattern(Arc<PatternState>),
    Promise(Arc<PromiseState>),
}

/// The multiplexer's mutable state. All fields are covered by one mutex.
#[derive(Debug)]
pub(crate) struct Registry {
    /// Maps a channel to the handles interested in it. Entry exists iff
    /// the refcount is at least one.
    pub(crate) channels: AHashMap<Bytes, Vec<Arc<ChannelState>>>,
    /// Maps a pattern to the handles interested in it.
    pub(crate) patterns: AHashMap<Bytes, Vec<Arc<PatternState>>>,
    /// Channels acknowledged by Redis in the current generation.
    pub(crate) active_channels: AHashSet<Bytes>,
    /// Patterns acknowledged by Redis in the current generation.
    pub(crate) active_patterns: AHashSet<Bytes>,
    /// Every live subscription, for disconnect fan-out and close-all.
    pub(crate) subscriptions: Vec<SubscriptionRef>,
    /// Command handle of the current listener, `None` while reconnecting.
    pub(crate) listener: Option<crate::listener::ListenerHandle>,
    /// Incremented on every disconnect; activation marks are scoped to it.
    pub(crate) generation: u64,
    pub(crate) closed: bool,
}

impl Registry {
    fn new() -> Self {
        Self {
            channels: AHashMap::new(),
            patterns: AHashMap::new(),
            active_channels: AHashSet::new(),
            active_patterns: AHashSet::new(),
            subscriptions: Vec::new(),
            listener: None,
            generation: 0,
            closed: false,
        }
    }

    /// Registers `sub`'s interest in `channel`, issuing a SUBSCRIBE only on
    /// the 0→1 refcount transition. If the channel is already active in the
    /// current generation, the activation callback is scheduled for the new
    /// handle.
    pub(crate) fn add_channel(&mut self, channel: Bytes, sub: &Arc<ChannelState>) {
        if let Some(subs) = self.channels.get_mut(&channel) {
            subs.push(sub.clone());
            if self.active_channels.contains(&channel) {
                if let Some(callback) = &sub.on_activation {
                    callback.schedule(channel);
                }
            }
        } else {
            self.channels.insert(channel.clone(), vec![sub.clone()]);
            if let Some(listener) = &self.listener {
                listener.subscribe(channel);
            }
        }
    }

    /// Drops `sub_id`'s interest in `channel`, issuing an UNSUBSCRIBE only on
    /// the 1→0 refcount transition.
    pub(crate) fn remove_channel(&mut self, channel: &Bytes, sub_id: u64) {
        if let Some(subs) = self.channels.get_mut(channel) {
            subs.retain(|s| s.id != sub_id);
            if subs.is_empty() {
                self.channels.remove(channel);
                self.active_channels.remove(channel);
                if let Some(listener) = &self.listener {
                    listener.unsubscribe(channel.clone());
                }
            }
        }
    }

    /// Registers `sub`'s interest in `pattern`, issuing a PSUBSCRIBE only on
    /// the 0→1 refcount transition.
    pub(crate) fn add_pattern(&mut self, pattern: Bytes, sub: &Arc<PatternState>) {
        if let Some(subs) = self.patterns.get_mut(&pattern) {
            subs.push(sub.clone());
            if self.active_patterns.contains(&pattern) {
                if let Some(callback) = &sub.on_activation {
                    callback.schedule(pattern);
                }
            }
        } else {
            self.patterns.insert(pattern.clone(), vec![sub.clone()]);
            if let Some(listener) = &self.listener {
                listener.psubscribe(pattern);
            }
        }
    }

    /// Drops `sub_id`'s interest in `pattern`, issuing a PUNSUBSCRIBE only on
    /// the 1→0 refcount transition.
    pub(crate) fn remove_pattern(&mut self, pattern: &Bytes, sub_id: u64) {
        if let Some(subs) = self.patterns.get_mut(pattern) {
            subs.retain(|s| s.id != sub_id);
            if subs.is_empty() {
                self.patterns.remove(pattern);
                self.active_patterns.remove(pattern);
                if let Some(listener) = &self.listener {
                    listener.punsubscribe(pattern.clone());
                }
            }
        }
    }

    /// Removes the subscription with `sub_id` from the fan-out list, pruning
    /// any dead registrations along the way.
    pub(crate) fn unregister(&mut self, sub_id: u64) {
        self.subscriptions
            .retain(|s| s.id().is_some_and(|id| id != sub_id));
    }
}

/// A multiplexer over a single Redis Pub/Sub connection.
///
/// One `Multiplexer` instance corresponds to one Redis Pub/Sub connection
/// shared by any number of [`ChannelSubscription`], [`PatternSubscription`]
/// and [`PromiseSubscription`] instances. The connection is never used for
/// publishing; open a separate Redis connection for `PUBLISH`.
///
/// On connection loss every live subscription is notified through its
/// `on_disconnect` callback, and the multiplexer reconnects with exponential
/// backoff, re-subscribing to everything the subscriptions still hold. Fresh
/// `on_activation` callbacks fire as the new connection acknowledges each
/// channel and pattern.
#[derive(Debug)]
pub struct Multiplexer {
    registry: Arc<Mutex<Registry>>,
    close_tx: watch::Sender<bool>,
    runner: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Multiplexer {
    /// Creates a new [`Multiplexer`] connecting to Redis per `config`.
    ///
    /// The connection is established in the background; subscriptions can be
    /// created immediately and their interest is declared once the connection
    /// is ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the reconnect backoff configuration is invalid.
    pub fn new(config: MultiplexerConfig) -> anyhow::Result<Self> {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(config.reconnect_delay_initial_ms),
            Duration::from_millis(config.reconnect_delay_max_ms),
            config.reconnect_backoff_factor,
            config.reconnect_jitter,
        )?;
        let factory: ConnectionFactory = Arc::new(move || {
            let config = config.clone();
            Box::pin(async move { Listener::connect(&config).await })
        });
        Ok(Self::with_factory(factory, backoff))
    }

    /// Creates a new [`Multiplexer`] obtaining connections from `factory`.
    ///
    /// The factory is invoked for the initial connection and for every
    /// reconnection attempt; `backoff` paces attempts after failures.
    #[must_use]
    pub fn with_factory(factory: ConnectionFactory, backoff: ExponentialBackoff) -> Self {
        let registry = Arc::new(Mutex::new(Registry::new()));
        let (close_tx, close_rx) = watch::channel(false);
        let runner = tokio::spawn(run(registry.clone(), factory, backoff, close_rx));

        Self {
            registry,
            close_tx,
            runner: Mutex::new(Some(runner)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Creates a new [`ChannelSubscription`] tied to this multiplexer.
    ///
    /// Any callback can be `None` if the corresponding events are of no
    /// interest. Call the subscription's `close` before disposing of it.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionClosed` if the multiplexer has been closed.
    pub fn new_channel_subscription(
        &self,
        on_message: Option<OnMessage>,
        on_disconnect: Option<OnDisconnect>,
        on_activation: Option<OnActivation>,
    ) -> Result<ChannelSubscription, MultiplexerError> {
        let mut registry = self.registry.lock().unwrap();
        if registry.closed {
            return Err(MultiplexerError::SubscriptionClosed);
        }

        let state = Arc::new(ChannelState::new(
            self.next_id(),
            on_message,
            on_disconnect,
            on_activation,
        ));
        registry
            .subscriptions
            .push(SubscriptionRef::Channel(Arc::downgrade(&state)));

        Ok(ChannelSubscription {
            state,
            registry: self.registry.clone(),
        })
    }

    /// Creates a new [`PatternSubscription`] tied to this multiplexer.
    ///
    /// The pattern uses Redis `PSUBSCRIBE` glob semantics and is matched
    /// server-side. Any callback can be `None` if the corresponding events
    /// are of no interest.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionClosed` if the multiplexer has been closed.
    pub fn new_pattern_subscription(
        &self,
        pattern: impl Into<Bytes>,
        on_message: Option<OnMessage>,
        on_disconnect: Option<OnDisconnect>,
        on_activation: Option<OnActivation>,
    ) -> Result<PatternSubscription, MultiplexerError> {
        let pattern: Bytes = pattern.into();
        let mut registry = self.registry.lock().unwrap();
        if registry.closed {
            return Err(MultiplexerError::SubscriptionClosed);
        }

        let state = Arc::new(PatternState::new(
            self.next_id(),
            pattern.clone(),
            on_message,
            on_disconnect,
            on_activation,
        ));
        registry.add_pattern(pattern, &state);
        registry
            .subscriptions
            .push(SubscriptionRef::Pattern(Arc::downgrade(&state)));

        Ok(PatternSubscription {
            state,
            registry: self.registry.clone(),
        })
    }

    /// Creates a new [`PromiseSubscription`] tied to this multiplexer.
    ///
    /// The prefix is used to create an internal pattern subscription matching
    /// every channel that starts with it, so that creating a promise never
    /// sends a command to Redis.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionClosed` if the multiplexer has been closed.
    pub fn new_promise_subscription(
        &self,
        prefix: impl Into<Bytes>,
    ) -> Result<PromiseSubscription, MultiplexerError> {
        let prefix: Bytes = prefix.into();
        let mut pattern = BytesMut::with_capacity(prefix.len() + 1);
        pattern.extend_from_slice(&prefix);
        pattern.put_u8(b'*');
        let pattern = pattern.freeze();

        let mut registry = self.registry.lock().unwrap();
        if registry.closed {
            return Err(MultiplexerError::SubscriptionClosed);
        }

        let promise_state = Arc::new(PromiseState::new(self.next_id(), prefix));

        let weak = Arc::downgrade(&promise_state);
        let on_message = OnMessage::sync(move |(channel, payload): (Bytes, Bytes)| {
            if let Some(state) = weak.upgrade() {
                state.resolve(&channel, &payload);
            }
        });
        let weak = Arc::downgrade(&promise_state);
        let on_activation = OnActivation::sync(move |_pattern: Bytes| {
            if let Some(state) = weak.upgrade() {
                state.activate();
            }
        });

        let pattern_state = Arc::new(PatternState::new(
            self.next_id(),
            pattern.clone(),
            Some(on_message),
            None,
            Some(on_activation),
        ));
        registry.add_pattern(pattern, &pattern_state);
        registry
            .subscriptions
            .push(SubscriptionRef::Promise(Arc::downgrade(&promise_state)));

        Ok(PromiseSubscription::new(
            promise_state,
            PatternSubscription {
                state: pattern_state,
                registry: self.registry.clone(),
            },
        ))
    }

    /// Returns whether the multiplexer has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.registry.lock().unwrap().closed
    }

    /// Closes the multiplexer.
    ///
    /// Every registered subscription is closed (unregistering its interest),
    /// the reconnect loop is cancelled and the connection released. Idempotent.
    pub async fn close(&self) {
        let subscriptions = {
            let mut registry = self.registry.lock().unwrap();
            registry.closed = true;
            std::mem::take(&mut registry.subscriptions)
        };

        {
            let mut registry = self.registry.lock().unwrap();
            for subscription in &subscriptions {
                match subscription {
                    SubscriptionRef::Channel(w) => {
                        if let Some(state) = w.upgrade() {
                            state.close(&mut registry);
                        }
                    }
                    SubscriptionRef::Pattern(w) => {
                        if let Some(state) = w.upgrade() {
                            state.close(&mut registry);
                        }
                    }
                    SubscriptionRef::Promise(w) => {
                        if let Some(state) = w.upgrade() {
                            state.close();
                        }
                    }
                }
            }
            registry.channels.clear();
            registry.patterns.clear();
            registry.active_channels.clear();
            registry.active_patterns.clear();
            registry.listener = None;
        }

        let _ = self.close_tx.send(true);

        let handle = self.runner.lock().unwrap().take();
        if let Some(handle) = handle {
            await_handle(handle, "multiplexer-run").await;
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Joins a task handle, logging rather than propagating failures.
async fn await_handle(handle: JoinHandle<()>, task_name: &str) {
    let timeout = Duration::from_secs(2);
    match tokio::time::timeout(timeout, handle).await {
        Ok(result) => {
            if let Err(e) = result {
                tracing::error!("Error awaiting task '{task_name}': {e:?}");
            }
        }
        Err(_) => {
            tracing::error!("Timeout {timeout:?} awaiting task '{task_name}'");
        }
    }
}

/// The connection controller: connect with backoff, re-declare interest,
/// dispatch events, and start over when the connection fails.
async fn run(
    registry: Arc<Mutex<Registry>>,
    factory: ConnectionFactory,
    mut backoff: ExponentialBackoff,
    mut close_rx: watch::Receiver<bool>,
) {
    tracing::debug!("Started task 'multiplexer-run'");

    loop {
        // Establish a connection, backing off between failed attempts
        let mut listener = loop {
            if *close_rx.borrow() {
                tracing::debug!("Completed task 'multiplexer-run'");
                return;
            }
            match factory().await {
                Ok(listener) => break listener,
                Err(e) => {
                    let delay = backoff.next_duration();
                    tracing::warn!("Connection attempt failed (next attempt in {delay:?}): {e}");
                    tokio::select! {
                        () = sleep(delay) => {}
                        _ = close_rx.changed() => {
                            tracing::debug!("Completed task 'multiplexer-run'");
                            return;
                        }
                    }
                }
            }
        };
        backoff.reset();

        // Re-declare all current interest on the fresh connection
        {
            let mut reg = registry.lock().unwrap();
            if reg.closed {
                tracing::debug!("Completed task 'multiplexer-run'");
                return;
            }
            let handle = listener.handle();
            for channel in reg.channels.keys() {
                handle.subscribe(channel.clone());
            }
            for pattern in reg.patterns.keys() {
                handle.psubscribe(pattern.clone());
            }
            reg.listener = Some(handle);
            tracing::info!(generation = reg.generation, "Connection ready");
        }

        // Consume events until the connection fails
        let reason = 'events: loop {
            tokio::select! {
                event = listener.recv() => match event {
                    ListenerEvent::Message { channel, payload } => {
                        dispatch_message(&registry, &channel, &payload);
                    }
                    ListenerEvent::PatternMessage { pattern, channel, payload } => {
                        dispatch_pattern_message(&registry, &pattern, &channel, &payload);
                    }
                    ListenerEvent::SubscribeAck { channel } => {
                        handle_subscribe_ack(&registry, &channel);
                    }
                    ListenerEvent::PSubscribeAck { pattern } => {
                        handle_psubscribe_ack(&registry, &pattern);
                    }
                    ListenerEvent::UnsubscribeAck { .. }
                    | ListenerEvent::PUnsubscribeAck { .. } => {}
                    ListenerEvent::Disconnected { reason } => break 'events reason,
                },
                _ = close_rx.changed() => {
                    tracing::debug!("Completed task 'multiplexer-run'");
                    return;
                }
            }
        };

        let error = MultiplexerError::Connection(reason);
        tracing::warn!("Reconnecting because of error: {error}");

        // Invalidate connection state and notify every live subscription
        let targets: Vec<DisconnectTarget> = {
            let mut reg = registry.lock().unwrap();
            if reg.closed {
                tracing::debug!("Completed task 'multiplexer-run'");
                return;
            }
            reg.generation += 1;
            reg.active_channels.clear();
            reg.active_patterns.clear();
            reg.listener = None;
            reg.subscriptions
                .iter()
                .filter_map(|s| match s {
                    SubscriptionRef::Channel(w) => w.upgrade().map(DisconnectTarget::Channel),
                    SubscriptionRef::Pattern(w) => w.upgrade().map(DisconnectTarget::Pattern),
                    SubscriptionRef::Promise(w) => w.upgrade().map(DisconnectTarget::Promise),
                })
                .collect()
        };

        for target in targets {
            match target {
                DisconnectTarget::Channel(state) => {
                    if !state.closed.load(Ordering::SeqCst) {
                        if let Some(callback) = &state.on_disconnect {
                            callback.invoke(error.clone());
                        }
                    }
                }
                DisconnectTarget::Pattern(state) => {
                    if state.is_live() {
                        if let Some(callback) = &state.on_disconnect {
                            callback.invoke(error.clone());
                        }
                    }
                }
                DisconnectTarget::Promise(state) => state.handle_disconnect(),
            }
        }
    }
}

/// Delivers a channel message to every interested handle.
///
/// Unknown channels are dropped silently: the message raced with a
/// just-issued unsubscribe.
fn dispatch_message(registry: &Mutex<Registry>, channel: &Bytes, payload: &Bytes) {
    let targets = { registry.lock().unwrap().channels.get(channel).cloned() };
    let Some(targets) = targets else {
        return;
    };
    for sub in targets {
        if sub.is_interested(channel) {
            if let Some(callback) = &sub.on_message {
                callback.invoke((channel.clone(), payload.clone()));
            }
        }
    }
}

/// Delivers a pattern-matched message to every handle on the pattern. The
/// real channel name is passed through; the pattern only identifies the
/// subscription.
fn dispatch_pattern_message(
    registry: &Mutex<Registry>,
    pattern: &Bytes,
    channel: &Bytes,
    payload: &Bytes,
) {
    let targets = { registry.lock().unwrap().patterns.get(pattern).cloned() };
    let Some(targets) = targets else {
        return;
    };
    for sub in targets {
        if sub.is_live() {
            if let Some(callback) = &sub.on_message {
                callback.invoke((channel.clone(), payload.clone()));
            }
        }
    }
}

/// Marks `channel` active for the current generation and delivers
/// `on_activation` to every handle currently in its set.
fn handle_subscribe_ack(registry: &Mutex<Registry>, channel: &Bytes) {
    let targets = {
        let mut reg = registry.lock().unwrap();
        let Some(subs) = reg.channels.get(channel) else {
            // Raced with a just-issued unsubscribe
            return;
        };
        let subs = subs.clone();
        reg.active_channels.insert(channel.clone());
        subs
    };
    for sub in targets {
        if !sub.closed.load(Ordering::SeqCst) {
            if let Some(callback) = &sub.on_activation {
                callback.invoke(channel.clone());
            }
        }
    }
}

/// Marks `pattern` active for the current generation and delivers
/// `on_activation` to every handle on it.
fn handle_psubscribe_ack(registry: &Mutex<Registry>, pattern: &Bytes) {
    let targets = {
        let mut reg = registry.lock().unwrap();
        let Some(subs) = reg.patterns.get(pattern) else {
            return;
        };
        let subs = subs.clone();
        reg.active_patterns.insert(pattern.clone());
        subs
    };
    for sub in targets {
        if sub.is_live() {
            if let Some(callback) = &sub.on_activation {
                callback.invoke(pattern.clone());
            }
        }
    }
}

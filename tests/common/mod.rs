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

//! An in-memory fake of the Redis Pub/Sub transport.
//!
//! The fake accepts listener commands, tracks the subscribed channel and
//! pattern sets per connection, auto-acknowledges every (P)(UN)SUBSCRIBE and
//! routes published messages through exact-channel and glob-pattern matching,
//! which is enough surface to drive the multiplexer end-to-end without a
//! Redis server. Connection attempts can be failed on demand to exercise the
//! reconnect loop.

#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use redismpx::{
    ConnectionFactory, ExponentialBackoff, Listener, ListenerCommand, ListenerEvent, Multiplexer,
    MultiplexerError, OnActivation, OnDisconnect, OnMessage,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

#[derive(Debug, Default)]
struct ServerConnection {
    index: usize,
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
    event_tx: Option<UnboundedSender<ListenerEvent>>,
}

#[derive(Debug, Default)]
struct MockRedisInner {
    current: Mutex<ServerConnection>,
    /// Commands received, tagged with the index of the connection they
    /// arrived on.
    commands: Mutex<Vec<(usize, ListenerCommand)>>,
    /// Timestamps of every connection attempt, successful or not.
    attempt_times: Mutex<Vec<Instant>>,
    attempts: AtomicUsize,
    established: AtomicUsize,
    fail_connects: AtomicUsize,
}

/// An in-memory stand-in for a Redis Pub/Sub server.
#[derive(Clone, Debug, Default)]
pub struct MockRedis {
    inner: Arc<MockRedisInner>,
}

impl MockRedis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a connection factory producing listeners wired to this fake.
    pub fn factory(&self) -> ConnectionFactory {
        let inner = self.inner.clone();
        Arc::new(move || {
            let inner = inner.clone();
            Box::pin(async move {
                inner.attempt_times.lock().unwrap().push(Instant::now());
                inner.attempts.fetch_add(1, Ordering::SeqCst);

                let failures = inner.fail_connects.load(Ordering::SeqCst);
                if failures > 0 {
                    inner.fail_connects.store(failures - 1, Ordering::SeqCst);
                    anyhow::bail!("connection refused");
                }

                let conn_index = inner.established.fetch_add(1, Ordering::SeqCst);
                let (cmd_tx, cmd_rx) = unbounded_channel();
                let (event_tx, event_rx) = unbounded_channel();
                {
                    let mut current = inner.current.lock().unwrap();
                    *current = ServerConnection {
                        index: conn_index,
                        channels: HashSet::new(),
                        patterns: HashSet::new(),
                        event_tx: Some(event_tx),
                    };
                }
                tokio::spawn(serve_connection(inner.clone(), conn_index, cmd_rx));

                Ok(Listener::from_parts(cmd_tx, event_rx))
            })
        })
    }

    /// Creates a multiplexer against this fake with a fast deterministic backoff.
    pub fn multiplexer(&self) -> Multiplexer {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(20),
            2.0,
            0.0,
        )
        .unwrap();
        Multiplexer::with_factory(self.factory(), backoff)
    }

    /// Fails the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Publishes a message, routing it through exact and pattern matching.
    pub fn publish(&self, channel: &'static [u8], payload: &'static [u8]) {
        let channel = Bytes::from_static(channel);
        let payload = Bytes::from_static(payload);
        let current = self.inner.current.lock().unwrap();
        let Some(event_tx) = &current.event_tx else {
            return;
        };
        if current.channels.contains(&channel) {
            let _ = event_tx.send(ListenerEvent::Message {
                channel: channel.clone(),
                payload: payload.clone(),
            });
        }
        for pattern in &current.patterns {
            if glob_match(pattern, &channel) {
                let _ = event_tx.send(ListenerEvent::PatternMessage {
                    pattern: pattern.clone(),
                    channel: channel.clone(),
                    payload: payload.clone(),
                });
            }
        }
    }

    /// Kills the current connection, surfacing a disconnect to the listener.
    pub fn kill(&self) {
        let mut current = self.inner.current.lock().unwrap();
        if let Some(event_tx) = current.event_tx.take() {
            let _ = event_tx.send(ListenerEvent::Disconnected {
                reason: "connection reset by peer".to_string(),
            });
        }
        current.channels.clear();
        current.patterns.clear();
    }

    /// Returns the channels subscribed on the current connection.
    pub fn subscribed_channels(&self) -> HashSet<Bytes> {
        self.inner.current.lock().unwrap().channels.clone()
    }

    /// Returns the patterns subscribed on the current connection.
    pub fn subscribed_patterns(&self) -> HashSet<Bytes> {
        self.inner.current.lock().unwrap().patterns.clone()
    }

    /// Returns every command received so far, across all connections.
    pub fn commands(&self) -> Vec<ListenerCommand> {
        self.inner
            .commands
            .lock()
            .unwrap()
            .iter()
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Returns the commands received on connection `index` (0-based, counting
    /// established connections only).
    pub fn commands_for(&self, index: usize) -> Vec<ListenerCommand> {
        self.inner
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(conn, _)| *conn == index)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Returns the number of connection attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Returns the number of established connections.
    pub fn established(&self) -> usize {
        self.inner.established.load(Ordering::SeqCst)
    }

    /// Returns the timestamps of every connection attempt.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.inner.attempt_times.lock().unwrap().clone()
    }
}

/// Applies commands of one connection to the fake's state, auto-acking each.
async fn serve_connection(
    inner: Arc<MockRedisInner>,
    conn_index: usize,
    mut cmd_rx: UnboundedReceiver<ListenerCommand>,
) {
    while let Some(command) = cmd_rx.recv().await {
        inner
            .commands
            .lock()
            .unwrap()
            .push((conn_index, command.clone()));

        let ack = {
            let mut current = inner.current.lock().unwrap();
            // Commands from a replaced connection must not touch the new one
            if current.index != conn_index {
                continue;
            }
            let ack = match command {
                ListenerCommand::Subscribe(channel) => {
                    current.channels.insert(channel.clone());
                    ListenerEvent::SubscribeAck { channel }
                }
                ListenerCommand::Unsubscribe(channel) => {
                    current.channels.remove(&channel);
                    ListenerEvent::UnsubscribeAck { channel }
                }
                ListenerCommand::PSubscribe(pattern) => {
                    current.patterns.insert(pattern.clone());
                    ListenerEvent::PSubscribeAck { pattern }
                }
                ListenerCommand::PUnsubscribe(pattern) => {
                    current.patterns.remove(&pattern);
                    ListenerEvent::PUnsubscribeAck { pattern }
                }
            };
            current.event_tx.clone().map(|event_tx| (event_tx, ack))
        };
        if let Some((event_tx, ack)) = ack {
            let _ = event_tx.send(ack);
        }
    }
}

/// Matches Redis glob patterns supporting `*` and `?`.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|i| glob_match(rest, &text[i..])),
        Some((b'?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((&c, rest)) => text.first() == Some(&c) && glob_match(rest, &text[1..]),
    }
}

/// Polls `cond` until it holds, panicking after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            Instant::now() < deadline,
            "condition not met within deadline"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Receives from `rx` with a one second deadline.
pub async fn recv_timeout<T>(rx: &mut UnboundedReceiver<T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for delivery")
}

pub fn message_sink() -> (OnMessage, UnboundedReceiver<(Bytes, Bytes)>) {
    let (tx, rx) = unbounded_channel();
    let on_message = OnMessage::sync(move |delivery: (Bytes, Bytes)| {
        let _ = tx.send(delivery);
    });
    (on_message, rx)
}

pub fn activation_sink() -> (OnActivation, UnboundedReceiver<Bytes>) {
    let (tx, rx) = unbounded_channel();
    let on_activation = OnActivation::sync(move |name: Bytes| {
        let _ = tx.send(name);
    });
    (on_activation, rx)
}

pub fn disconnect_sink() -> (OnDisconnect, UnboundedReceiver<MultiplexerError>) {
    let (tx, rx) = unbounded_channel();
    let on_disconnect = OnDisconnect::sync(move |error: MultiplexerError| {
        let _ = tx.send(error);
    });
    (on_disconnect, rx)
}

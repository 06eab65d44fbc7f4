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

//! Ownership of a single Redis Pub/Sub connection.
//!
//! A [`Listener`] serializes outbound (P)SUBSCRIBE/(P)UNSUBSCRIBE commands
//! through one writer task and classifies every inbound push frame into a
//! [`ListenerEvent`] consumed by the multiplexer. A listener never reconnects:
//! its first transport failure is reported exactly once as
//! [`ListenerEvent::Disconnected`], after which it is terminal and must be
//! replaced.
//!
//! **Design**:
//! - Writer task owns the connection and drains the command queue in FIFO order
//! - Ingress task classifies RESP3 push frames into events
//! - Both report failure through a shared, deduplicating event sender

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use redis::{AsyncConnectionConfig, PushInfo, PushKind, Value, aio::MultiplexedConnection};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::config::{MultiplexerConfig, get_redis_url};

/// A subscription command for the writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerCommand {
    /// Subscribe to an exact channel.
    Subscribe(Bytes),
    /// Unsubscribe from an exact channel.
    Unsubscribe(Bytes),
    /// Subscribe to a glob pattern.
    PSubscribe(Bytes),
    /// Unsubscribe from a glob pattern.
    PUnsubscribe(Bytes),
}

/// A classified inbound frame from the Redis connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerEvent {
    /// A message published on an exactly subscribed channel.
    Message {
        /// The channel the message was published on.
        channel: Bytes,
        /// The raw message payload.
        payload: Bytes,
    },
    /// A message matched by a pattern subscription.
    PatternMessage {
        /// The pattern which matched.
        pattern: Bytes,
        /// The actual channel the message was published on.
        channel: Bytes,
        /// The raw message payload.
        payload: Bytes,
    },
    /// Acknowledgement of a SUBSCRIBE command.
    SubscribeAck {
        /// The channel now active.
        channel: Bytes,
    },
    /// Acknowledgement of a PSUBSCRIBE command.
    PSubscribeAck {
        /// The pattern now active.
        pattern: Bytes,
    },
    /// Acknowledgement of an UNSUBSCRIBE command.
    UnsubscribeAck {
        /// The channel no longer subscribed.
        channel: Bytes,
    },
    /// Acknowledgement of a PUNSUBSCRIBE command.
    PUnsubscribeAck {
        /// The pattern no longer subscribed.
        pattern: Bytes,
    },
    /// The connection failed. Terminal: the listener must be replaced.
    Disconnected {
        /// A description of the failure cause.
        reason: String,
    },
}

/// A cloneable handle for enqueueing subscription commands on a listener.
///
/// Sending methods return once the command has been enqueued on the writer
/// task, not once it has been acknowledged. Concurrent callers observe FIFO
/// order. Commands sent to a terminated listener are dropped; the reconnect
/// path re-declares all interest on the replacement connection.
#[derive(Clone, Debug)]
pub struct ListenerHandle {
    cmd_tx: UnboundedSender<ListenerCommand>,
}

impl ListenerHandle {
    /// Enqueues a SUBSCRIBE for `channel`.
    pub fn subscribe(&self, channel: Bytes) {
        let _ = self.cmd_tx.send(ListenerCommand::Subscribe(channel));
    }

    /// Enqueues an UNSUBSCRIBE for `channel`.
    pub fn unsubscribe(&self, channel: Bytes) {
        let _ = self.cmd_tx.send(ListenerCommand::Unsubscribe(channel));
    }

    /// Enqueues a PSUBSCRIBE for `pattern`.
    pub fn psubscribe(&self, pattern: Bytes) {
        let _ = self.cmd_tx.send(ListenerCommand::PSubscribe(pattern));
    }

    /// Enqueues a PUNSUBSCRIBE for `pattern`.
    pub fn punsubscribe(&self, pattern: Bytes) {
        let _ = self.cmd_tx.send(ListenerCommand::PUnsubscribe(pattern));
    }
}

/// Owns one Redis Pub/Sub connection.
///
/// Obtained from a connection factory by the multiplexer, which drives the
/// reconnect loop; the listener itself never reconnects.
#[derive(Debug)]
pub struct Listener {
    cmd_tx: UnboundedSender<ListenerCommand>,
    event_rx: UnboundedReceiver<ListenerEvent>,
}

impl Listener {
    /// Connects to Redis per `config` and spawns the writer and ingress tasks.
    ///
    /// The connection is opened in RESP3 mode with a push sender installed so
    /// that messages, subscription acknowledgements and disconnection are all
    /// delivered as classifiable push frames.
    ///
    /// # Errors
    ///
    /// Returns an error if constructing the client or establishing the
    /// connection fails.
    pub async fn connect(config: &MultiplexerConfig) -> anyhow::Result<Self> {
        let (url, redacted_url) = get_redis_url(&config.connection);
        tracing::debug!("Connecting to {redacted_url}");

        let client = redis::Client::open(url)?;
        let (push_tx, push_rx) = unbounded_channel::<PushInfo>();
        let connection_config = AsyncConnectionConfig::new().set_push_sender(push_tx);
        let connection = client
            .get_multiplexed_async_connection_with_config(&connection_config)
            .await?;
        tracing::debug!("Connected");

        Ok(Self::spawn(connection, push_rx))
    }

    /// Assembles a listener over an already-established connection.
    fn spawn(connection: MultiplexedConnection, push_rx: UnboundedReceiver<PushInfo>) -> Self {
        let (cmd_tx, cmd_rx) = unbounded_channel::<ListenerCommand>();
        let (event_tx, event_rx) = unbounded_channel::<ListenerEvent>();
        let events = EventSender::new(event_tx);

        tokio::spawn(run_writer(connection, cmd_rx, events.clone()));
        tokio::spawn(run_ingress(push_rx, events));

        Self { cmd_tx, event_rx }
    }

    /// Assembles a listener from raw command and event channels.
    ///
    /// This bypasses Redis entirely and is the seam for custom transports and
    /// in-memory test fakes.
    #[must_use]
    pub fn from_parts(
        cmd_tx: UnboundedSender<ListenerCommand>,
        event_rx: UnboundedReceiver<ListenerEvent>,
    ) -> Self {
        Self { cmd_tx, event_rx }
    }

    /// Returns a cloneable command handle for this listener.
    #[must_use]
    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Enqueues a SUBSCRIBE for `channel`.
    pub fn subscribe(&self, channel: Bytes) {
        let _ = self.cmd_tx.send(ListenerCommand::Subscribe(channel));
    }

    /// Enqueues an UNSUBSCRIBE for `channel`.
    pub fn unsubscribe(&self, channel: Bytes) {
        let _ = self.cmd_tx.send(ListenerCommand::Unsubscribe(channel));
    }

    /// Enqueues a PSUBSCRIBE for `pattern`.
    pub fn psubscribe(&self, pattern: Bytes) {
        let _ = self.cmd_tx.send(ListenerCommand::PSubscribe(pattern));
    }

    /// Enqueues a PUNSUBSCRIBE for `pattern`.
    pub fn punsubscribe(&self, pattern: Bytes) {
        let _ = self.cmd_tx.send(ListenerCommand::PUnsubscribe(pattern));
    }

    /// Receives the next classified event from the connection.
    ///
    /// If the event stream has ended this returns a terminal
    /// [`ListenerEvent::Disconnected`].
    pub async fn recv(&mut self) -> ListenerEvent {
        match self.event_rx.recv().await {
            Some(event) => event,
            None => ListenerEvent::Disconnected {
                reason: "event stream ended".to_string(),
            },
        }
    }
}

/// Forwards events to the multiplexer, reporting at most one disconnection.
#[derive(Clone, Debug)]
struct EventSender {
    event_tx: UnboundedSender<ListenerEvent>,
    failed: Arc<AtomicBool>,
}

impl EventSender {
    fn new(event_tx: UnboundedSender<ListenerEvent>) -> Self {
        Self {
            event_tx,
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sends `event`, suppressing everything after the first disconnection.
    ///
    /// Returns `false` once the listener is terminal.
    fn send(&self, event: ListenerEvent) -> bool {
        if self.failed.load(Ordering::Acquire) {
            return false;
        }
        let disconnect = matches!(event, ListenerEvent::Disconnected { .. });
        if disconnect && self.failed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.event_tx.send(event).is_ok() && !disconnect
    }
}

/// Drains the command queue into the owned connection, in FIFO order.
async fn run_writer(
    mut connection: MultiplexedConnection,
    mut cmd_rx: UnboundedReceiver<ListenerCommand>,
    events: EventSender,
) {
    tracing::trace!("Started task 'listener-writer'");

    while let Some(command) = cmd_rx.recv().await {
        let result = match command {
            ListenerCommand::Subscribe(channel) => connection.subscribe(channel.to_vec()).await,
            ListenerCommand::Unsubscribe(channel) => connection.unsubscribe(channel.to_vec()).await,
            ListenerCommand::PSubscribe(pattern) => connection.psubscribe(pattern.to_vec()).await,
            ListenerCommand::PUnsubscribe(pattern) => {
                connection.punsubscribe(pattern.to_vec()).await
            }
        };

        if let Err(e) = result {
            events.send(ListenerEvent::Disconnected {
                reason: e.to_string(),
            });
            break;
        }
    }

    tracing::trace!("Completed task 'listener-writer'");
}

/// Classifies inbound push frames into listener events.
async fn run_ingress(mut push_rx: UnboundedReceiver<PushInfo>, events: EventSender) {
    tracing::trace!("Started task 'listener-ingress'");

    while let Some(push) = push_rx.recv().await {
        if let Some(event) = classify_push(push) {
            if !events.send(event) {
                break;
            }
        }
    }

    // The push stream ending means the connection driver is gone.
    events.send(ListenerEvent::Disconnected {
        reason: "connection closed".to_string(),
    });

    tracing::trace!("Completed task 'listener-ingress'");
}

/// Classifies a RESP3 push frame. Frames irrelevant to Pub/Sub yield `None`.
fn classify_push(push: PushInfo) -> Option<ListenerEvent> {
    let mut values = push.data.into_iter();

    match push.kind {
        PushKind::Message => Some(ListenerEvent::Message {
            channel: next_bytes(&mut values)?,
            payload: next_bytes(&mut values)?,
        }),
        PushKind::PMessage => Some(ListenerEvent::PatternMessage {
            pattern: next_bytes(&mut values)?,
            channel: next_bytes(&mut values)?,
            payload: next_bytes(&mut values)?,
        }),
        PushKind::Subscribe => Some(ListenerEvent::SubscribeAck {
            channel: next_bytes(&mut values)?,
        }),
        PushKind::PSubscribe => Some(ListenerEvent::PSubscribeAck {
            pattern: next_bytes(&mut values)?,
        }),
        PushKind::Unsubscribe => Some(ListenerEvent::UnsubscribeAck {
            channel: next_bytes(&mut values)?,
        }),
        PushKind::PUnsubscribe => Some(ListenerEvent::PUnsubscribeAck {
            pattern: next_bytes(&mut values)?,
        }),
        PushKind::Disconnection => Some(ListenerEvent::Disconnected {
            reason: "connection reset".to_string(),
        }),
        _ => None,
    }
}

fn next_bytes(values: &mut impl Iterator<Item = Value>) -> Option<Bytes> {
    match values.next()? {
        Value::BulkString(data) => Some(Bytes::from(data)),
        Value::SimpleString(s) => Some(Bytes::from(s.into_bytes())),
        _ => None,
    }
}

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

//! A Redis Pub/Sub multiplexer.
//!
//! The `redismpx` crate multiplexes the Pub/Sub interest of many local
//! clients (e.g. WebSocket sessions) onto a single shared Redis connection.
//! Subscriptions are reference-counted so the connection only carries
//! channels some client still cares about, the connection transparently
//! reconnects with exponential backoff and jitter, and three subscription
//! abstractions are exposed on top of the shared transport:
//!
//! - [`ChannelSubscription`]: one callback set tied to zero or more exact
//!   channel names, with add/remove over its lifetime.
//! - [`PatternSubscription`]: one callback set tied to a single glob pattern,
//!   matched server-side by Redis `PSUBSCRIBE`.
//! - [`PromiseSubscription`]: timed, single-delivery, cancellable rendezvous
//!   with individual Pub/Sub messages, layered on a pattern subscription.
//!
//! Channel names, patterns and payloads are arbitrary bytes end-to-end; no
//! UTF-8 is assumed. The shared connection is never used for publishing;
//! open a separate Redis connection for `PUBLISH`.
//!
//! ```no_run
//! use bytes::Bytes;
//! use redismpx::{Multiplexer, MultiplexerConfig, OnMessage};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mpx = Multiplexer::new(MultiplexerConfig::default())?;
//!
//!     let on_message = OnMessage::sync(|(channel, payload): (Bytes, Bytes)| {
//!         println!("ch: {channel:?} msg: {payload:?}");
//!     });
//!     let sub = mpx.new_channel_subscription(Some(on_message), None, None)?;
//!     sub.add("hello-world")?;
//!
//!     // ... PUBLISH hello-world "hi" from any Redis client ...
//!
//!     sub.close();
//!     mpx.close().await;
//!     Ok(())
//! }
//! ```

#![deny(nonstandard_style)]
#![deny(missing_debug_implementations)]
#![deny(clippy::missing_errors_doc)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod backoff;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod listener;
pub mod multiplexer;
pub mod promise;
pub mod subscription;

pub use crate::{
    backoff::ExponentialBackoff,
    callbacks::{Callback, OnActivation, OnDisconnect, OnMessage},
    config::{ConnectionConfig, MultiplexerConfig},
    error::MultiplexerError,
    listener::{Listener, ListenerCommand, ListenerEvent},
    multiplexer::{ConnectionFactory, Multiplexer},
    promise::{Promise, PromiseSubscription},
    subscription::{ChannelSubscription, PatternSubscription},
};

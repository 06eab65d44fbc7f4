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

//! Error types surfaced by the multiplexer and its subscriptions.

use thiserror::Error;

/// A typed error enumeration for the multiplexer.
///
/// `Connection` errors are always recovered by the reconnect loop and reach
/// users only through `on_disconnect` callbacks; the remaining variants
/// surface at the call or await site which triggered them.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MultiplexerError {
    /// The underlying Redis connection failed.
    #[error("connection error: {0}")]
    Connection(String),
    /// The subscription (or the owning multiplexer) has been closed.
    #[error("subscription closed")]
    SubscriptionClosed,
    /// The subscription is not active in the current connection generation.
    #[error("subscription inactive")]
    InactiveSubscription,
    /// The promise deadline elapsed before a message arrived.
    #[error("promise timed out")]
    TimedOut,
    /// The promise was cancelled by a disconnection or subscription close.
    #[error("promise cancelled")]
    Cancelled,
}

impl From<redis::RedisError> for MultiplexerError {
    fn from(error: redis::RedisError) -> Self {
        Self::Connection(error.to_string())
    }
}

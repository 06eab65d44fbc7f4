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

//! Subscriber callback adapters.
//!
//! Subscribers register plain functions or async functions for message,
//! disconnect and activation events. Both shapes are represented by a single
//! tagged [`Callback`] value so the dispatch path does not care which one it
//! is invoking. A panic inside a subscriber callback is contained and logged;
//! it never tears down the multiplexer.

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::error::MultiplexerError;

/// Callback invoked for every message delivered to a subscription,
/// with the originating channel name and the raw payload.
pub type OnMessage = Callback<(Bytes, Bytes)>;

/// Callback invoked when the shared connection is lost.
pub type OnDisconnect = Callback<MultiplexerError>;

/// Callback invoked when a channel or pattern subscription goes into effect.
pub type OnActivation = Callback<Bytes>;

/// A subscriber callback, either a plain function or an async function.
///
/// Plain functions are invoked inline on the dispatch task; async functions
/// are spawned as independent tasks so dispatch is never blocked awaiting
/// user code.
pub enum Callback<A> {
    /// A plain function invoked inline.
    Sync(Arc<dyn Fn(A) + Send + Sync>),
    /// An async function spawned onto the runtime.
    Async(Arc<dyn Fn(A) -> BoxFuture<'static, ()> + Send + Sync>),
}

impl<A> Clone for Callback<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(f.clone()),
            Self::Async(f) => Self::Async(f.clone()),
        }
    }
}

impl<A: Send + 'static> Callback<A> {
    /// Creates a callback from a plain function.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    /// Creates a callback from an async function.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Async(Arc::new(move |args| Box::pin(f(args))))
    }

    /// Invokes the callback with `args`.
    ///
    /// Sync callbacks run inline with panics contained; async callbacks are
    /// spawned and complete independently.
    pub fn invoke(&self, args: A) {
        match self {
            Self::Sync(f) => {
                if catch_unwind(AssertUnwindSafe(|| f(args))).is_err() {
                    tracing::warn!("Subscriber callback panicked");
                }
            }
            Self::Async(f) => {
                tokio::spawn(f(args));
            }
        }
    }

    /// Schedules the callback as an independent task.
    ///
    /// Used where the caller must never observe a reentrant invocation,
    /// regardless of the callback shape.
    pub fn schedule(&self, args: A) {
        let callback = self.clone();
        tokio::spawn(async move {
            match &callback {
                Callback::Sync(f) => {
                    if catch_unwind(AssertUnwindSafe(|| f(args))).is_err() {
                        tracing::warn!("Subscriber callback panicked");
                    }
                }
                Callback::Async(f) => f(args).await,
            }
        });
    }
}

impl<A> fmt::Debug for Callback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => write!(f, "Callback::Sync"),
            Self::Async(_) => write!(f, "Callback::Async"),
        }
    }
}

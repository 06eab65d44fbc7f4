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

//! Provides an implementation of an exponential backoff mechanism with jitter support.
//! It is used for managing reconnection delays in the multiplexer's connect loop.
//!
//! The backoff mechanism allows the delay to grow exponentially up to a configurable
//! maximum, applying a configurable fraction of full jitter to avoid synchronized
//! reconnection storms.

use std::time::Duration;

use rand::Rng;

/// An exponential backoff mechanism with configurable jitter.
///
/// This struct computes successive delays for reconnect attempts.
/// It starts from an initial delay and multiplies it by a factor on each iteration,
/// capping the delay at a maximum value. The jitter fraction controls how much of
/// each delay is randomized: with `jitter = 1.0` (full jitter) the returned delay
/// is a uniform sample in `[0, delay]`, with `jitter = 0.0` it is deterministic.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// The initial backoff delay.
    delay_initial: Duration,
    /// The maximum delay to cap the backoff.
    delay_max: Duration,
    /// The current backoff delay.
    delay_current: Duration,
    /// The factor to multiply the delay on each iteration.
    factor: f64,
    /// The fraction of each delay subject to randomization, in `[0, 1]`.
    jitter: f64,
}

impl ExponentialBackoff {
    /// Creates a new [`ExponentialBackoff`] instance.
    ///
    /// # Errors
    ///
    /// Returns an error if `factor` is less than 1.0 or `jitter` is outside `[0, 1]`.
    pub fn new(
        delay_initial: Duration,
        delay_max: Duration,
        factor: f64,
        jitter: f64,
    ) -> anyhow::Result<Self> {
        if !factor.is_finite() || factor < 1.0 {
            anyhow::bail!("`factor` must be >= 1.0, was {factor}");
        }
        if !jitter.is_finite() || !(0.0..=1.0).contains(&jitter) {
            anyhow::bail!("`jitter` must be in [0, 1], was {jitter}");
        }

        Ok(Self {
            delay_initial,
            delay_max,
            delay_current: delay_initial,
            factor,
            jitter,
        })
    }

    /// Return the next backoff delay with jitter and update the internal state.
    ///
    /// The returned delay is the current base delay perturbed by the jitter
    /// fraction (a uniform sample in `[(1 - jitter) * base, base]`); the base
    /// delay is then advanced to `min(delay_max, base * factor)`.
    pub fn next_duration(&mut self) -> Duration {
        let base = self.delay_current;

        let delay = if self.jitter > 0.0 {
            let scale = (1.0 - self.jitter) + self.jitter * rand::rng().random_range(0.0..=1.0);
            Duration::from_secs_f64(base.as_secs_f64() * scale)
        } else {
            base
        };

        // Prepare the next delay
        let next_nanos = (base.as_nanos() as f64 * self.factor) as u128;
        let max_nanos = self.delay_max.as_nanos();
        self.delay_current = duration_from_nanos(std::cmp::min(next_nanos, max_nanos));

        delay
    }

    /// Reset the backoff to its initial state.
    pub const fn reset(&mut self) {
        self.delay_current = self.delay_initial;
    }

    /// Returns the current base delay without jitter.
    /// This represents the delay that the next call to `next_duration` will use
    /// as its base, before any jitter is applied.
    #[must_use]
    pub const fn current_delay(&self) -> Duration {
        self.delay_current
    }
}

const fn duration_from_nanos(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    Duration::new(
        (nanos / NANOS_PER_SEC) as u64,
        (nanos % NANOS_PER_SEC) as u32,
    )
}

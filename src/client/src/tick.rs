// Copyright 2024 RisingWave Labs
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

//! The monotonic tick source standing in for animation frames: pokes
//! completing within one tick window are applied together. Non-browser
//! hosts drive the handler from a steady interval; tests call `on_tick`
//! directly.

use std::time::Duration;

use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::poke_handler::PokeHandler;

pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    /// A display-refresh-like cadence.
    pub fn at_60hz() -> Self {
        Self::with_period(Duration::from_micros(16_667))
    }

    pub fn with_period(period: Duration) -> Self {
        let mut interval = interval(period);
        // A stalled consumer wants one catch-up tick, not a burst.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Drive a handler until the future is dropped.
    pub async fn drive(mut self, handler: &mut PokeHandler) {
        loop {
            self.tick().await;
            handler.on_tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticker_fires_on_cadence() {
        let mut ticker = IntervalTicker::with_period(Duration::from_millis(10));
        // First tick completes immediately by tokio convention.
        ticker.tick().await;
        let before = tokio::time::Instant::now();
        ticker.tick().await;
        assert!(tokio::time::Instant::now() - before >= Duration::from_millis(10));
    }
}

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

use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Bounded exponential backoff with jitter. `next_delay` doubles up to the
/// cap; `reset` is called after a successful attempt.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    rng: SmallRng,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self
            .config
            .min_delay
            .saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .min(self.config.max_delay);
        self.attempt = self.attempt.saturating_add(1);
        // Up to 25% jitter, so a herd of retries spreads out.
        let jitter_cap = (base / 4).as_millis() as u64;
        let jitter = if jitter_cap == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.gen_range(0..=jitter_cap))
        };
        base + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let config = BackoffConfig {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        let mut backoff = Backoff::new(config);

        let mut prev = Duration::ZERO;
        for _ in 0..16 {
            let delay = backoff.next_delay();
            // Base is bounded by max plus the 25% jitter allowance.
            assert!(delay <= config.max_delay + config.max_delay / 4);
            assert!(delay >= config.min_delay);
            if prev < config.max_delay {
                assert!(delay + delay / 2 >= prev, "delays should trend upward");
            }
            prev = delay;
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}

/*
 * Copyright 2023 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Passive health checking of upstream endpoints.

use std::{net::SocketAddr, time::Duration};

use dashmap::DashMap;
use tokio::time::Instant;

use super::metrics;

pub const DEFAULT_CONSECUTIVE_FAILURES: u32 = 5;
pub const DEFAULT_EJECTION_TIME: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Default)]
struct EndpointHealth {
    consecutive_failures: u32,
    ejected_until: Option<Instant>,
}

/// Ejects endpoints that fail to accept several connections in a row, so
/// they are skipped for a while.
#[derive(Debug)]
pub struct OutlierDetector {
    consecutive_failures: u32,
    ejection_time: Duration,
    endpoints: DashMap<SocketAddr, EndpointHealth>,
}

impl Default for OutlierDetector {
    fn default() -> Self {
        Self::new(DEFAULT_CONSECUTIVE_FAILURES, DEFAULT_EJECTION_TIME)
    }
}

impl OutlierDetector {
    pub fn new(consecutive_failures: u32, ejection_time: Duration) -> Self {
        Self {
            consecutive_failures: consecutive_failures.max(1),
            ejection_time,
            endpoints: DashMap::new(),
        }
    }

    pub fn record_success(&self, address: SocketAddr) {
        self.endpoints.remove(&address);
    }

    /// Returns `true` when this failure ejected the endpoint.
    pub fn record_failure(&self, address: SocketAddr) -> bool {
        let mut health = self.endpoints.entry(address).or_default();
        health.consecutive_failures += 1;

        if health.consecutive_failures >= self.consecutive_failures {
            health.consecutive_failures = 0;
            health.ejected_until = Some(Instant::now() + self.ejection_time);
            drop(health);
            tracing::warn!(%address, ejection_time = ?self.ejection_time, "ejecting endpoint");
            metrics::ejections().inc();
            return true;
        }

        false
    }

    pub fn is_ejected(&self, address: &SocketAddr) -> bool {
        self.endpoints
            .get(address)
            .and_then(|health| health.ejected_until)
            .map_or(false, |until| Instant::now() < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ejects_after_consecutive_failures() {
        let detector = OutlierDetector::default();
        let address = SocketAddr::from(([127, 0, 0, 1], 9080));

        for _ in 0..4 {
            assert!(!detector.record_failure(address));
        }
        assert!(!detector.is_ejected(&address));
        assert!(detector.record_failure(address));
        assert!(detector.is_ejected(&address));

        tokio::time::advance(DEFAULT_EJECTION_TIME).await;
        assert!(!detector.is_ejected(&address));
    }

    #[tokio::test]
    async fn success_resets_failures() {
        let detector = OutlierDetector::default();
        let address = SocketAddr::from(([127, 0, 0, 1], 9080));

        for _ in 0..4 {
            detector.record_failure(address);
        }
        detector.record_success(address);
        for _ in 0..4 {
            assert!(!detector.record_failure(address));
        }
        assert!(!detector.is_ejected(&address));
    }
}

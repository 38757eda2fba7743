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

//! Picks the upstream endpoint for an outbound connection.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;
use rand::{thread_rng, Rng};

use super::outlier::OutlierDetector;
use crate::{
    config::Config,
    mesh::{Endpoint, LoadBalancerPolicy, Route},
};

/// Chooses one of a non-empty set of endpoints.
pub trait EndpointChooser: Send + Sync {
    /// Returns the index of the chosen endpoint in `endpoints`.
    fn choose(&self, endpoints: &[&Endpoint], source: &SocketAddr) -> usize;
}

/// RoundRobinEndpointChooser chooses endpoints in round-robin order.
#[derive(Debug, Default)]
pub struct RoundRobinEndpointChooser {
    next_endpoint: AtomicUsize,
}

impl EndpointChooser for RoundRobinEndpointChooser {
    fn choose(&self, endpoints: &[&Endpoint], _: &SocketAddr) -> usize {
        self.next_endpoint.fetch_add(1, Ordering::Relaxed) % endpoints.len()
    }
}

/// RandomEndpointChooser chooses endpoints in random order.
pub struct RandomEndpointChooser;

impl EndpointChooser for RandomEndpointChooser {
    fn choose(&self, endpoints: &[&Endpoint], _: &SocketAddr) -> usize {
        thread_rng().gen_range(0..endpoints.len())
    }
}

/// HashEndpointChooser chooses endpoints based on a hash of the client's IP
/// address, so a client keeps reaching the same endpoint while the set is
/// unchanged.
pub struct HashEndpointChooser;

impl EndpointChooser for HashEndpointChooser {
    fn choose(&self, endpoints: &[&Endpoint], source: &SocketAddr) -> usize {
        let mut hasher = DefaultHasher::new();
        source.ip().hash(&mut hasher);
        (hasher.finish() % endpoints.len() as u64) as usize
    }
}

/// Routes outbound connections: applies traffic splits, skips ejected
/// endpoints and balances load across what remains.
#[derive(Debug, Default)]
pub struct Router {
    round_robin: DashMap<String, RoundRobinEndpointChooser>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoints a new connection to `route.service` may use. A weighted
    /// subset is picked once per connection, so retries stay inside it.
    pub fn resolve(&self, config: &Config, route: &Route) -> Vec<Endpoint> {
        let services = config.services.load();
        match route.pick_subset() {
            Some(subset) => {
                tracing::trace!(service = %route.service, labels = ?subset.labels, "picked subset");
                services.subset(&route.service, &subset.labels)
            }
            None => services
                .get(&route.service)
                .map(|endpoints| endpoints.into_iter().collect())
                .unwrap_or_default(),
        }
    }

    /// Picks the endpoint for the next attempt. Ejected endpoints and those
    /// in `tried` are avoided, unless that would leave nothing to pick.
    pub fn pick(
        &self,
        route: &Route,
        endpoints: &[Endpoint],
        source: &SocketAddr,
        tried: &[SocketAddr],
        outliers: &OutlierDetector,
    ) -> Option<Endpoint> {
        let healthy: Vec<&Endpoint> = endpoints
            .iter()
            .filter(|endpoint| !outliers.is_ejected(&endpoint.address))
            .collect();
        let healthy = if healthy.is_empty() {
            tracing::debug!(service = %route.service, "every endpoint is ejected, ignoring ejections");
            endpoints.iter().collect()
        } else {
            healthy
        };

        let untried: Vec<&Endpoint> = healthy
            .iter()
            .copied()
            .filter(|endpoint| !tried.contains(&endpoint.address))
            .collect();
        let candidates = if untried.is_empty() { healthy } else { untried };

        if candidates.is_empty() {
            return None;
        }

        let index = match route.load_balancer {
            LoadBalancerPolicy::RoundRobin => self
                .round_robin
                .entry(route.service.clone())
                .or_default()
                .choose(&candidates, source),
            LoadBalancerPolicy::Random => RandomEndpointChooser.choose(&candidates, source),
            LoadBalancerPolicy::Hash => HashEndpointChooser.choose(&candidates, source),
        };

        Some(candidates[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, time::Duration};

    use super::*;
    use crate::mesh::route::WeightedSubset;
    use pretty_assertions::assert_eq;

    fn endpoint(port: u16, version: &str) -> Endpoint {
        Endpoint::new(SocketAddr::from(([127, 0, 0, 1], port)))
            .with_labels([("version".to_owned(), version.to_owned())])
    }

    fn client() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 45000))
    }

    #[test]
    fn round_robin_cycles() {
        let router = Router::new();
        let route = Route::default_for("reviews");
        let endpoints = vec![endpoint(1, "v1"), endpoint(2, "v1"), endpoint(3, "v1")];
        let outliers = OutlierDetector::default();

        let picked: Vec<u16> = (0..6)
            .map(|_| {
                router
                    .pick(&route, &endpoints, &client(), &[], &outliers)
                    .unwrap()
                    .address
                    .port()
            })
            .collect();
        assert_eq!(vec![1, 2, 3, 1, 2, 3], picked);
    }

    #[test]
    fn hash_is_sticky() {
        let router = Router::new();
        let route = Route {
            load_balancer: LoadBalancerPolicy::Hash,
            ..Route::default_for("reviews")
        };
        let endpoints = vec![endpoint(1, "v1"), endpoint(2, "v1"), endpoint(3, "v1")];
        let outliers = OutlierDetector::default();

        let first = router.pick(&route, &endpoints, &client(), &[], &outliers);
        for _ in 0..10 {
            assert_eq!(first, router.pick(&route, &endpoints, &client(), &[], &outliers));
        }
    }

    #[test]
    fn avoids_tried_and_ejected_endpoints() {
        let router = Router::new();
        let route = Route {
            load_balancer: LoadBalancerPolicy::Random,
            ..Route::default_for("reviews")
        };
        let endpoints = vec![endpoint(1, "v1"), endpoint(2, "v1"), endpoint(3, "v1")];
        let outliers = OutlierDetector::new(1, Duration::from_secs(30));
        outliers.record_failure(endpoints[0].address);

        for _ in 0..20 {
            let picked = router
                .pick(&route, &endpoints, &client(), &[endpoints[1].address], &outliers)
                .unwrap();
            assert_eq!(endpoints[2], picked);
        }

        // Everything was tried, so anything healthy is fair game again.
        let all: Vec<_> = endpoints.iter().map(|e| e.address).collect();
        let picked = router
            .pick(&route, &endpoints, &client(), &all, &outliers)
            .unwrap();
        assert_ne!(endpoints[0], picked);

        assert!(router
            .pick(&route, &[], &client(), &[], &outliers)
            .is_none());
    }

    #[test]
    fn resolve_applies_splits() {
        let config = Config::default();
        config.services.modify(|services| {
            services.insert(
                "reviews",
                BTreeSet::from([endpoint(1, "v1"), endpoint(2, "v2"), endpoint(3, "v2")]),
            );
        });

        let router = Router::new();
        assert_eq!(3, router.resolve(&config, &Route::default_for("reviews")).len());
        assert!(router.resolve(&config, &Route::default_for("ratings")).is_empty());

        let only_v2 = Route {
            splits: vec![
                WeightedSubset {
                    labels: [("version".to_owned(), "v1".to_owned())].into(),
                    weight: 0,
                },
                WeightedSubset {
                    labels: [("version".to_owned(), "v2".to_owned())].into(),
                    weight: 100,
                },
            ],
            ..Route::default_for("reviews")
        };
        for _ in 0..10 {
            let resolved = router.resolve(&config, &only_v2);
            assert_eq!(
                vec![2, 3],
                resolved.iter().map(|e| e.address.port()).collect::<Vec<_>>()
            );
        }
    }
}

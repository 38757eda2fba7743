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

//! Routing rules: traffic splitting, retries and load balancing.

use std::{collections::BTreeMap, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    config::error::{ValidationError, ValueInvalidArgs},
    generated::trellis::mesh::v1 as proto,
    mesh::endpoint::Labels,
};

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_PER_TRY_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_BACKOFF_MS: u64 = 25;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// How outbound connections to a service are routed.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Route {
    pub service: String,
    /// Weighted label subsets the service's traffic is split across. Empty
    /// means every endpoint of the service is eligible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub splits: Vec<WeightedSubset>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub load_balancer: LoadBalancerPolicy,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

impl Route {
    /// The route used for services without an explicit one.
    pub fn default_for(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            splits: Vec::new(),
            retry: <_>::default(),
            load_balancer: <_>::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn total_weight(&self) -> u64 {
        self.splits.iter().map(|split| u64::from(split.weight)).sum()
    }

    /// Picks a subset at random, in proportion to the subsets' weights.
    /// `None` means the whole service is eligible.
    pub fn pick_subset(&self) -> Option<&WeightedSubset> {
        use rand::Rng;
        let total = self.total_weight();
        if total == 0 {
            return None;
        }
        self.subset_at(rand::thread_rng().gen_range(0..total))
    }

    /// The subset owning position `roll` in `[0, total weight)`.
    pub fn subset_at(&self, roll: u64) -> Option<&WeightedSubset> {
        let mut upper = 0;
        for split in &self.splits {
            upper += u64::from(split.weight);
            if roll < upper {
                return Some(split);
            }
        }
        None
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.service.is_empty() {
            return Err(ValueInvalidArgs {
                field: "routes.service".into(),
                clarification: Some("a route must name the service it applies to".into()),
                examples: None,
            }
            .into());
        }

        for (i, split) in self.splits.iter().enumerate() {
            if self.splits[..i]
                .iter()
                .any(|other| other.labels == split.labels)
            {
                return Err(ValidationError::NotUnique(format!(
                    "routes.{}.splits.labels",
                    self.service
                )));
            }
        }

        if self.retry.attempts == 0 {
            return Err(ValueInvalidArgs {
                field: format!("routes.{}.retry.attempts", self.service),
                clarification: Some("must allow at least one attempt".into()),
                examples: Some(vec!["1".into(), "3".into()]),
            }
            .into());
        }

        Ok(())
    }
}

/// A share of a service's traffic sent to the endpoints carrying `labels`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WeightedSubset {
    #[serde(default)]
    pub labels: Labels,
    pub weight: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total number of connection attempts, including the first.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_per_try_timeout_ms")]
    pub per_try_timeout_ms: u64,
    /// Base delay between attempts, doubled after every failure.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

fn default_per_try_timeout_ms() -> u64 {
    DEFAULT_PER_TRY_TIMEOUT_MS
}

fn default_backoff_ms() -> u64 {
    DEFAULT_BACKOFF_MS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            per_try_timeout_ms: DEFAULT_PER_TRY_TIMEOUT_MS,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    pub fn per_try_timeout(&self) -> Duration {
        Duration::from_millis(self.per_try_timeout_ms)
    }

    /// The delay before attempt number `attempt` (1 based) is retried.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }
}

/// How an endpoint is chosen among the eligible ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancerPolicy {
    #[default]
    RoundRobin,
    Random,
    /// Pins a client address to an endpoint for as long as the endpoint set
    /// is unchanged.
    Hash,
}

/// Every route known to the mesh, keyed by service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "Vec<Route>", into = "Vec<Route>")]
pub struct RouteTable(BTreeMap<String, Route>);

impl JsonSchema for RouteTable {
    fn schema_name() -> String {
        <Vec<Route>>::schema_name()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        <Vec<Route>>::json_schema(gen)
    }
}

impl RouteTable {
    /// The route for `service`, or the default route if none was configured.
    pub fn get(&self, service: &str) -> Route {
        self.0
            .get(service)
            .cloned()
            .unwrap_or_else(|| Route::default_for(service))
    }

    pub fn contains(&self, service: &str) -> bool {
        self.0.contains_key(service)
    }

    pub fn insert(&mut self, route: Route) {
        self.0.insert(route.service.clone(), route);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.0.values()
    }
}

impl From<Vec<Route>> for RouteTable {
    fn from(routes: Vec<Route>) -> Self {
        Self(
            routes
                .into_iter()
                .map(|route| (route.service.clone(), route))
                .collect(),
        )
    }
}

impl From<RouteTable> for Vec<Route> {
    fn from(table: RouteTable) -> Self {
        table.0.into_values().collect()
    }
}

impl From<Route> for proto::Route {
    fn from(route: Route) -> Self {
        let load_balancer = match route.load_balancer {
            LoadBalancerPolicy::RoundRobin => proto::route::LoadBalancer::RoundRobin,
            LoadBalancerPolicy::Random => proto::route::LoadBalancer::Random,
            LoadBalancerPolicy::Hash => proto::route::LoadBalancer::Hash,
        };

        Self {
            service: route.service,
            splits: route
                .splits
                .into_iter()
                .map(|split| proto::WeightedSubset {
                    labels: split.labels.into_iter().collect(),
                    weight: split.weight,
                })
                .collect(),
            retry: Some(proto::RetryPolicy {
                attempts: route.retry.attempts,
                per_try_timeout_ms: route.retry.per_try_timeout_ms,
                backoff_ms: route.retry.backoff_ms,
            }),
            load_balancer: load_balancer.into(),
            connect_timeout_ms: route.connect_timeout_ms,
        }
    }
}

impl TryFrom<proto::Route> for Route {
    type Error = ValidationError;

    fn try_from(route: proto::Route) -> Result<Self, Self::Error> {
        let load_balancer = match proto::route::LoadBalancer::try_from(route.load_balancer) {
            Ok(proto::route::LoadBalancer::RoundRobin) => LoadBalancerPolicy::RoundRobin,
            Ok(proto::route::LoadBalancer::Random) => LoadBalancerPolicy::Random,
            Ok(proto::route::LoadBalancer::Hash) => LoadBalancerPolicy::Hash,
            Err(_) => {
                return Err(ValueInvalidArgs {
                    field: format!("routes.{}.load_balancer", route.service),
                    clarification: Some(format!("unknown policy {}", route.load_balancer)),
                    examples: Some(vec!["ROUND_ROBIN".into(), "RANDOM".into(), "HASH".into()]),
                }
                .into())
            }
        };

        let retry = route
            .retry
            .map(|retry| RetryPolicy {
                attempts: retry.attempts,
                per_try_timeout_ms: retry.per_try_timeout_ms,
                backoff_ms: retry.backoff_ms,
            })
            .unwrap_or_default();

        let route = Self {
            service: route.service,
            splits: route
                .splits
                .into_iter()
                .map(|split| WeightedSubset {
                    labels: split.labels.into_iter().collect(),
                    weight: split.weight,
                })
                .collect(),
            retry,
            load_balancer,
            connect_timeout_ms: if route.connect_timeout_ms == 0 {
                DEFAULT_CONNECT_TIMEOUT_MS
            } else {
                route.connect_timeout_ms
            },
        };

        route.validate()?;
        Ok(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn split(version: &str, weight: u32) -> WeightedSubset {
        WeightedSubset {
            labels: [("version".into(), version.into())].into(),
            weight,
        }
    }

    #[test]
    fn subset_selection_follows_weights() {
        let route = Route {
            splits: vec![split("v1", 90), split("v2", 0), split("v3", 10)],
            ..Route::default_for("reviews")
        };

        assert_eq!(Some(&route.splits[0]), route.subset_at(0));
        assert_eq!(Some(&route.splits[0]), route.subset_at(89));
        assert_eq!(Some(&route.splits[2]), route.subset_at(90));
        assert_eq!(Some(&route.splits[2]), route.subset_at(99));
        assert_eq!(None, route.subset_at(100));

        for _ in 0..100 {
            let picked = route.pick_subset().unwrap();
            assert_ne!(picked.labels, split("v2", 0).labels);
        }
    }

    #[test]
    fn zero_total_weight_uses_whole_service() {
        let route = Route {
            splits: vec![split("v1", 0)],
            ..Route::default_for("reviews")
        };
        assert_eq!(None, route.pick_subset());
        assert_eq!(None, Route::default_for("reviews").pick_subset());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(Duration::from_millis(25), retry.backoff(1));
        assert_eq!(Duration::from_millis(50), retry.backoff(2));
        assert_eq!(Duration::from_millis(100), retry.backoff(3));
        assert_eq!(MAX_BACKOFF, retry.backoff(30));
    }

    #[test]
    fn table_falls_back_to_default_route() {
        let table = RouteTable::from(vec![Route {
            load_balancer: LoadBalancerPolicy::Hash,
            ..Route::default_for("reviews")
        }]);

        assert_eq!(LoadBalancerPolicy::Hash, table.get("reviews").load_balancer);
        assert_eq!(Route::default_for("ratings"), table.get("ratings"));
    }

    #[test]
    fn yaml() {
        let table: RouteTable = serde_yaml::from_str(
            "
- service: reviews
  splits:
    - labels: { version: v1 }
      weight: 75
    - labels: { version: v2 }
      weight: 25
  retry:
    attempts: 5
  load_balancer: RANDOM
",
        )
        .unwrap();

        let route = table.get("reviews");
        assert_eq!(2, route.splits.len());
        assert_eq!(5, route.retry.attempts);
        assert_eq!(DEFAULT_BACKOFF_MS, route.retry.backoff_ms);
        assert_eq!(LoadBalancerPolicy::Random, route.load_balancer);
        assert_eq!(DEFAULT_CONNECT_TIMEOUT_MS, route.connect_timeout_ms);
    }

    #[test]
    fn validation() {
        let route = Route {
            splits: vec![split("v1", 50), split("v1", 50)],
            ..Route::default_for("reviews")
        };
        assert_eq!(
            "field routes.reviews.splits.labels is not unique",
            route.validate().unwrap_err().to_string()
        );

        let route = Route {
            retry: RetryPolicy {
                attempts: 0,
                ..<_>::default()
            },
            ..Route::default_for("reviews")
        };
        assert!(route.validate().is_err());
    }

    #[test]
    fn proto_conversion_fills_defaults() {
        let route = Route::try_from(proto::Route {
            service: "reviews".into(),
            retry: Some(proto::RetryPolicy {
                attempts: 2,
                per_try_timeout_ms: 10,
                backoff_ms: 1,
            }),
            load_balancer: proto::route::LoadBalancer::Random.into(),
            ..<_>::default()
        })
        .unwrap();

        assert_eq!(2, route.retry.attempts);
        assert_eq!(LoadBalancerPolicy::Random, route.load_balancer);
        assert_eq!(DEFAULT_CONNECT_TIMEOUT_MS, route.connect_timeout_ms);

        assert!(Route::try_from(proto::Route {
            service: "reviews".into(),
            load_balancer: 42,
            ..<_>::default()
        })
        .is_err());
    }
}

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

//! The service registry.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering::Relaxed},
};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    config::{
        error::{ValidationError, ValueInvalidArgs},
        watch::{Marker, Watchable},
    },
    generated::trellis::mesh::v1 as proto,
    mesh::{endpoint::Labels, Endpoint},
};

pub type EndpointSet = BTreeSet<Endpoint>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("{address} is already registered by a live `{registered}` sidecar, refusing to register it for `{service}`")]
    AddressInUse {
        address: SocketAddr,
        service: String,
        registered: String,
    },
}

const SUBSYSTEM: &str = "registry";

pub(crate) fn active_services() -> &'static prometheus::IntGauge {
    static ACTIVE_SERVICES: Lazy<prometheus::IntGauge> = Lazy::new(|| {
        crate::metrics::register(
            prometheus::IntGauge::with_opts(crate::metrics::opts(
                "active_services",
                SUBSYSTEM,
                "Number of services currently known to the registry",
            ))
            .unwrap(),
        )
    });

    &ACTIVE_SERVICES
}

pub(crate) fn active_endpoints() -> &'static prometheus::IntGauge {
    static ACTIVE_ENDPOINTS: Lazy<prometheus::IntGauge> = Lazy::new(|| {
        crate::metrics::register(
            prometheus::IntGauge::with_opts(crate::metrics::opts(
                "active_endpoints",
                SUBSYSTEM,
                "Number of endpoints currently known to the registry",
            ))
            .unwrap(),
        )
    });

    &ACTIVE_ENDPOINTS
}

/// A named service and its endpoints, as written in a config file or sent
/// over the discovery stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default)]
    pub endpoints: EndpointSet,
}

impl ServiceDefinition {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValueInvalidArgs {
                field: "services.name".into(),
                clarification: Some("service names cannot be empty".into()),
                examples: None,
            }
            .into());
        }

        let mut addresses = BTreeSet::new();
        for endpoint in &self.endpoints {
            if !addresses.insert(endpoint.address) {
                return Err(ValidationError::NotUnique(format!(
                    "services.{}.endpoints.address ({})",
                    self.name, endpoint.address
                )));
            }
        }

        Ok(())
    }
}

impl From<ServiceDefinition> for proto::Service {
    fn from(service: ServiceDefinition) -> Self {
        Self {
            name: service.name,
            endpoints: service.endpoints.into_iter().map(From::from).collect(),
        }
    }
}

impl TryFrom<proto::Service> for ServiceDefinition {
    type Error = crate::mesh::endpoint::EndpointError;

    fn try_from(service: proto::Service) -> Result<Self, Self::Error> {
        Ok(Self {
            name: service.name,
            endpoints: service
                .endpoints
                .into_iter()
                .map(Endpoint::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}

#[derive(Debug)]
struct Registration {
    service: String,
    endpoint: Endpoint,
    streams: usize,
}

/// Where the registry's contents come from: a base set (a config file on the
/// control plane, the discovery stream on a sidecar) and live registrations
/// from connected sidecars layered on top.
#[derive(Debug, Default)]
struct Sources {
    base: BTreeMap<String, EndpointSet>,
    registrations: BTreeMap<SocketAddr, Registration>,
}

impl Sources {
    fn effective(&self) -> BTreeMap<String, EndpointSet> {
        let mut services = self.base.clone();
        for registration in self.registrations.values() {
            let endpoints = services.entry(registration.service.clone()).or_default();
            endpoints.retain(|endpoint| endpoint.address != registration.endpoint.address);
            endpoints.insert(registration.endpoint.clone());
        }
        services
    }
}

/// A concurrent map of service names to their endpoints.
///
/// Reads go through a [`DashMap`] so the proxy's hot path never contends with
/// writers; every write recomputes the map and bumps the version only when
/// the contents actually changed.
#[derive(Debug, Default)]
pub struct ServiceMap {
    services: DashMap<String, EndpointSet>,
    sources: Mutex<Sources>,
    version: AtomicU64,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the endpoints for `service` in the base set.
    pub fn insert(&self, service: impl Into<String>, endpoints: EndpointSet) {
        let mut sources = self.sources.lock();
        sources.base.insert(service.into(), endpoints);
        self.rebuild(&sources);
    }

    /// Removes `service` from the base set, returning whether it was present.
    pub fn remove(&self, service: &str) -> bool {
        let mut sources = self.sources.lock();
        let removed = sources.base.remove(service).is_some();
        self.rebuild(&sources);
        removed
    }

    /// Replaces the whole base set, keeping live registrations.
    pub fn replace(&self, services: impl IntoIterator<Item = ServiceDefinition>) {
        let mut sources = self.sources.lock();
        sources.base = services
            .into_iter()
            .map(|service| (service.name, service.endpoints))
            .collect();
        self.rebuild(&sources);
    }

    /// Registers `endpoint` as an instance of `service`. Registering the same
    /// address again (e.g. from a second stream) increments its reference
    /// count instead of adding a duplicate. An address held by another
    /// service stays with that service until its last stream is gone.
    pub fn register(
        &self,
        service: impl Into<String>,
        endpoint: Endpoint,
    ) -> Result<(), RegistrationError> {
        let service = service.into();
        let mut sources = self.sources.lock();
        match sources.registrations.get_mut(&endpoint.address) {
            Some(registration) if registration.service != service => {
                return Err(RegistrationError::AddressInUse {
                    address: endpoint.address,
                    service,
                    registered: registration.service.clone(),
                });
            }
            Some(registration) => {
                registration.streams += 1;
                registration.endpoint = endpoint;
            }
            None => {
                sources.registrations.insert(
                    endpoint.address,
                    Registration {
                        service,
                        endpoint,
                        streams: 1,
                    },
                );
            }
        }
        self.rebuild(&sources);
        Ok(())
    }

    /// Releases one registration of `address`, removing the endpoint once no
    /// stream holds it. Returns whether the endpoint was removed.
    pub fn deregister(&self, address: SocketAddr) -> bool {
        let mut sources = self.sources.lock();
        let removed = match sources.registrations.get_mut(&address) {
            Some(registration) if registration.streams > 1 => {
                registration.streams -= 1;
                false
            }
            Some(_) => {
                sources.registrations.remove(&address);
                true
            }
            None => false,
        };
        self.rebuild(&sources);
        removed
    }

    fn rebuild(&self, sources: &Sources) {
        let effective = sources.effective();
        let mut changed = false;

        self.services.retain(|name, _| {
            let keep = effective.contains_key(name);
            changed |= !keep;
            keep
        });

        for (name, endpoints) in effective {
            let differs = self
                .services
                .get(&name)
                .map_or(true, |current| *current != endpoints);
            if differs {
                self.services.insert(name, endpoints);
                changed = true;
            }
        }

        if changed {
            self.version.fetch_add(1, Relaxed);
            active_services().set(self.services.len() as i64);
            active_endpoints().set(self.num_of_endpoints() as i64);
        }
    }

    pub fn get(&self, service: &str) -> Option<EndpointSet> {
        self.services.get(service).map(|entry| entry.value().clone())
    }

    /// The endpoints of `service` carrying every label in `selector`.
    pub fn subset(&self, service: &str, selector: &Labels) -> Vec<Endpoint> {
        self.services
            .get(service)
            .map(|endpoints| {
                endpoints
                    .iter()
                    .filter(|endpoint| endpoint.matches_labels(selector))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.services.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn num_of_endpoints(&self) -> usize {
        self.services.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Relaxed)
    }

    /// A consistent, ordered copy of every service.
    pub fn snapshot(&self) -> Vec<ServiceDefinition> {
        let services: BTreeMap<_, _> = self
            .services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        services
            .into_iter()
            .map(|(name, endpoints)| ServiceDefinition { name, endpoints })
            .collect()
    }
}

impl Watchable for ServiceMap {
    #[inline]
    fn mark(&self) -> Marker {
        Marker::Version(self.version())
    }

    #[inline]
    fn has_changed(&self, marker: Marker) -> bool {
        let Marker::Version(marked) = marker;
        self.version() != marked
    }
}

impl PartialEq for ServiceMap {
    fn eq(&self, rhs: &Self) -> bool {
        self.snapshot() == rhs.snapshot()
    }
}

impl Serialize for ServiceMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ServiceMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let services = Vec::<ServiceDefinition>::deserialize(deserializer)?;
        let map = Self::new();
        map.replace(services);
        Ok(map)
    }
}

impl JsonSchema for ServiceMap {
    fn schema_name() -> String {
        <Vec<ServiceDefinition>>::schema_name()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        <Vec<ServiceDefinition>>::json_schema(gen)
    }

    fn is_referenceable() -> bool {
        <Vec<ServiceDefinition>>::is_referenceable()
    }
}

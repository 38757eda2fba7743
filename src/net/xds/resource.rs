/*
 * Copyright 2022 Google LLC
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

use std::collections::HashSet;

use prost_types::Any;

use super::proto;
use crate::{
    codec::prost::{decode_any, encode_any, AnyError},
    config::{Config, ValidationError},
    mesh::{endpoint::EndpointError, Policy, PolicySet, Route, RouteTable, ServiceDefinition},
};

const SERVICE_TYPE: &str = "type.googleapis.com/trellis.mesh.v1.Service";
const ROUTE_TYPE: &str = "type.googleapis.com/trellis.mesh.v1.Route";
const POLICY_TYPE: &str = "type.googleapis.com/trellis.mesh.v1.Policy";

/// The kinds of resource exchanged over a discovery stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, enum_map::Enum)]
pub enum ResourceType {
    Service,
    Route,
    Policy,
}

impl ResourceType {
    pub const VARIANTS: &'static [Self] = &[Self::Service, Self::Route, Self::Policy];

    /// The `type_url` identifying this resource in requests, responses and
    /// `Any` payloads.
    pub fn type_url(&self) -> &'static str {
        match self {
            Self::Service => SERVICE_TYPE,
            Self::Route => ROUTE_TYPE,
            Self::Policy => POLICY_TYPE,
        }
    }

    /// Encodes the current state of this resource type held in `config`.
    pub fn encode_all(&self, config: &Config) -> Result<Vec<Any>, prost::EncodeError> {
        match self {
            Self::Service => config
                .services
                .load()
                .snapshot()
                .into_iter()
                .map(|service| encode_any(SERVICE_TYPE, &proto::Service::from(service)))
                .collect(),
            Self::Route => config
                .routes
                .load()
                .iter()
                .map(|route| encode_any(ROUTE_TYPE, &proto::Route::from(route.clone())))
                .collect(),
            Self::Policy => config
                .policies
                .load()
                .iter()
                .map(|policy| encode_any(POLICY_TYPE, &proto::Policy::from(policy.clone())))
                .collect(),
        }
    }

    /// Replaces every resource of this type in `config` with `resources`.
    ///
    /// The whole set is validated before anything is applied, so a rejected
    /// response leaves the previous state untouched.
    pub fn apply_all(&self, config: &Config, resources: &[Any]) -> Result<(), ResourceError> {
        let resources = resources
            .iter()
            .map(Resource::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut names = HashSet::new();
        for resource in &resources {
            if resource.resource_type() != *self {
                return Err(ResourceError::UnexpectedType {
                    expected: *self,
                    found: resource.resource_type(),
                });
            }

            if !names.insert(resource.name()) {
                return Err(ValidationError::NotUnique(format!(
                    "{}.{}",
                    self.field_name(),
                    resource.name()
                ))
                .into());
            }
        }

        match self {
            Self::Service => {
                let services = resources
                    .into_iter()
                    .filter_map(Resource::into_service)
                    .collect::<Vec<_>>();
                config.services.modify(|map| map.replace(services));
            }
            Self::Route => {
                let routes = resources
                    .into_iter()
                    .filter_map(Resource::into_route)
                    .collect::<Vec<_>>();
                config.routes.replace_if_changed(RouteTable::from(routes));
            }
            Self::Policy => {
                let policies = resources
                    .into_iter()
                    .filter_map(Resource::into_policy)
                    .collect::<Vec<_>>();
                config
                    .policies
                    .replace_if_changed(PolicySet::from(policies));
            }
        }

        Ok(())
    }

    fn field_name(&self) -> &'static str {
        match self {
            Self::Service => "services",
            Self::Route => "routes",
            Self::Policy => "policies",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.type_url())
    }
}

impl TryFrom<&'_ str> for ResourceType {
    type Error = ResourceError;

    fn try_from(type_url: &str) -> Result<Self, Self::Error> {
        Self::VARIANTS
            .iter()
            .copied()
            .find(|ty| ty.type_url() == type_url)
            .ok_or_else(|| ResourceError::UnknownType(type_url.into()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("unknown resource type `{0}`")]
    UnknownType(String),
    #[error("expected `{expected}` resources, found `{found}`")]
    UnexpectedType {
        expected: ResourceType,
        found: ResourceType,
    },
    #[error(transparent)]
    Any(#[from] AnyError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A single decoded discovery resource.
#[derive(Clone, Debug, PartialEq)]
pub enum Resource {
    Service(ServiceDefinition),
    Route(Route),
    Policy(Policy),
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Service(_) => ResourceType::Service,
            Self::Route(_) => ResourceType::Route,
            Self::Policy(_) => ResourceType::Policy,
        }
    }

    /// The name the resource is keyed by, the service it belongs to.
    pub fn name(&self) -> &str {
        match self {
            Self::Service(service) => &service.name,
            Self::Route(route) => &route.service,
            Self::Policy(policy) => &policy.service,
        }
    }

    fn into_service(self) -> Option<ServiceDefinition> {
        match self {
            Self::Service(service) => Some(service),
            _ => None,
        }
    }

    fn into_route(self) -> Option<Route> {
        match self {
            Self::Route(route) => Some(route),
            _ => None,
        }
    }

    fn into_policy(self) -> Option<Policy> {
        match self {
            Self::Policy(policy) => Some(policy),
            _ => None,
        }
    }
}

impl TryFrom<&'_ Any> for Resource {
    type Error = ResourceError;

    fn try_from(any: &Any) -> Result<Self, Self::Error> {
        Ok(match ResourceType::try_from(&*any.type_url)? {
            ResourceType::Service => {
                let service = ServiceDefinition::try_from(decode_any::<proto::Service>(
                    SERVICE_TYPE,
                    any,
                )?)?;
                service.validate()?;
                Self::Service(service)
            }
            ResourceType::Route => {
                Self::Route(Route::try_from(decode_any::<proto::Route>(ROUTE_TYPE, any)?)?)
            }
            ResourceType::Policy => {
                Self::Policy(Policy::try_from(decode_any::<proto::Policy>(POLICY_TYPE, any)?)?)
            }
        })
    }
}

impl TryFrom<Resource> for Any {
    type Error = prost::EncodeError;

    fn try_from(resource: Resource) -> Result<Self, Self::Error> {
        match resource {
            Resource::Service(service) => encode_any(SERVICE_TYPE, &proto::Service::from(service)),
            Resource::Route(route) => encode_any(ROUTE_TYPE, &proto::Route::from(route)),
            Resource::Policy(policy) => encode_any(POLICY_TYPE, &proto::Policy::from(policy)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{Endpoint, MtlsMode};
    use pretty_assertions::assert_eq;

    fn reviews() -> ServiceDefinition {
        ServiceDefinition {
            name: "reviews".into(),
            endpoints: [Endpoint::new("127.0.0.1:9080".parse().unwrap())].into(),
        }
    }

    #[test]
    fn type_urls() {
        for ty in ResourceType::VARIANTS {
            assert_eq!(*ty, ResourceType::try_from(ty.type_url()).unwrap());
        }
        assert!(matches!(
            ResourceType::try_from("type.googleapis.com/envoy.config.cluster.v3.Cluster"),
            Err(ResourceError::UnknownType(_))
        ));
    }

    #[test]
    fn encode_then_apply_mirrors_config() {
        let source = Config::default();
        source.services.modify(|map| map.replace([reviews()]));
        source.routes.modify(|table| table.insert(Route::default_for("reviews")));
        source.policies.modify(|set| {
            let mut policy = Policy::default_for("reviews");
            policy.mtls = MtlsMode::Permissive;
            set.insert(policy)
        });

        let mirror = Config::default();
        for ty in ResourceType::VARIANTS {
            let resources = ty.encode_all(&source).unwrap();
            ty.apply_all(&mirror, &resources).unwrap();
        }

        assert_eq!(source, mirror);
    }

    #[test]
    fn rejected_set_leaves_state_untouched() {
        let config = Config::default();
        let valid = ResourceType::Service.encode_all(&{
            let config = Config::default();
            config.services.modify(|map| map.replace([reviews()]));
            config
        });
        ResourceType::Service
            .apply_all(&config, &valid.unwrap())
            .unwrap();

        let duplicated = vec![
            Any::try_from(Resource::Service(reviews())).unwrap(),
            Any::try_from(Resource::Service(reviews())).unwrap(),
        ];
        assert!(matches!(
            ResourceType::Service.apply_all(&config, &duplicated),
            Err(ResourceError::Validation(ValidationError::NotUnique(_)))
        ));

        let wrong_type = vec![Any::try_from(Resource::Route(Route::default_for("a"))).unwrap()];
        assert!(matches!(
            ResourceType::Service.apply_all(&config, &wrong_type),
            Err(ResourceError::UnexpectedType { .. })
        ));

        assert_eq!(1, config.services.read().num_of_endpoints());
    }
}

/*
 * Copyright 2020 Google LLC All Rights Reserved.
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

//! Mesh configuration: the file format and the live, shared [`Config`].

pub mod error;
mod slot;
pub mod watch;

use std::{collections::HashSet, io};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use self::{
    error::{ValidationError, ValueInvalidArgs},
    slot::Slot,
    watch::Watch,
};
use crate::mesh::{Policy, PolicySet, Route, RouteTable, ServiceDefinition, ServiceMap};

pub(crate) const BACKOFF_INITIAL_DELAY_MILLISECONDS: u64 = 500;
pub(crate) const BACKOFF_MAX_DELAY_SECONDS: u64 = 30;
pub(crate) const BACKOFF_MAX_JITTER_MILLISECONDS: u64 = 2000;
pub(crate) const CONNECTION_TIMEOUT: u64 = 5;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum Version {
    #[default]
    #[serde(rename = "v1alpha1")]
    V1Alpha1,
}

/// The on-disk configuration format.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl ConfigFile {
    /// Parses a YAML (or JSON) document.
    pub fn from_reader<R: io::Read>(input: R) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_reader(input)
    }

    pub fn from_slice(input: &[u8]) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_slice(input)
    }

    /// Validates the file. When `trust_domain` is given every endpoint
    /// identity must belong to it.
    pub fn validate(&self, trust_domain: Option<&str>) -> Result<(), ValidationError> {
        ensure_unique(self.services.iter().map(|s| &s.name), "services.name")?;
        ensure_unique(self.routes.iter().map(|r| &r.service), "routes.service")?;
        ensure_unique(self.policies.iter().map(|p| &p.service), "policies.service")?;

        for service in &self.services {
            service.validate()?;

            let foreign = trust_domain.and_then(|trust_domain| {
                service
                    .endpoints
                    .iter()
                    .filter_map(|endpoint| endpoint.identity.as_ref())
                    .find(|identity| !identity.in_trust_domain(trust_domain))
                    .map(|identity| (identity, trust_domain))
            });

            if let Some((identity, trust_domain)) = foreign {
                return Err(ValidationError::ForeignIdentity {
                    identity: identity.to_string(),
                    trust_domain: trust_domain.into(),
                });
            }
        }

        for route in &self.routes {
            route.validate()?;
        }

        for policy in &self.policies {
            policy.validate()?;
        }

        Ok(())
    }
}

fn ensure_unique<'a>(
    values: impl ExactSizeIterator<Item = &'a String>,
    field: &str,
) -> Result<(), ValidationError> {
    let expected = values.len();
    if values.collect::<HashSet<_>>().len() != expected {
        return Err(ValidationError::NotUnique(field.into()));
    }

    Ok(())
}

/// The live mesh configuration shared by every task of a process.
///
/// On the control plane it is filled from the config file and sidecar
/// registrations; on a sidecar it mirrors what the discovery stream sends.
#[derive(Debug, Serialize)]
pub struct Config {
    pub id: Slot<String>,
    pub services: Watch<ServiceMap>,
    pub routes: Slot<RouteTable>,
    pub policies: Slot<PolicySet>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(default_id())
    }
}

pub(crate) fn default_id() -> String {
    format!("trellis-{}", Uuid::new_v4().as_simple())
}

impl Config {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Slot::new(id.into()),
            services: Watch::default(),
            routes: Slot::default(),
            policies: Slot::default(),
        }
    }

    pub fn id(&self) -> String {
        String::clone(&self.id.load())
    }

    /// Validates `file` and makes it the current configuration. Services from
    /// the file replace the previous file's services; sidecar registrations
    /// are kept.
    pub fn apply(&self, file: ConfigFile, trust_domain: Option<&str>) -> Result<(), ValidationError> {
        file.validate(trust_domain)?;

        if let Some(id) = file.id {
            self.id.replace_if_changed(id);
        }

        self.services.modify(|services| services.replace(file.services));
        self.routes.replace_if_changed(RouteTable::from(file.routes));
        self.policies
            .replace_if_changed(PolicySet::from(file.policies));

        tracing::debug!(
            services = self.services.load().len(),
            routes = self.routes.load().len(),
            policies = self.policies.load().len(),
            "applied configuration"
        );

        Ok(())
    }

    /// Reads and applies the file at `path`.
    pub async fn apply_path(
        &self,
        path: &std::path::Path,
        trust_domain: Option<&str>,
    ) -> crate::Result<()> {
        let buf = tokio::fs::read(path).await?;
        self.apply(ConfigFile::from_slice(&buf)?, trust_domain)?;
        Ok(())
    }
}

impl PartialEq for Config {
    fn eq(&self, rhs: &Self) -> bool {
        self.services == rhs.services && self.routes == rhs.routes && self.policies == rhs.policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{LoadBalancerPolicy, MtlsMode};
    use pretty_assertions::assert_eq;

    fn parse(yaml: &str) -> ConfigFile {
        ConfigFile::from_reader(yaml.as_bytes()).unwrap()
    }

    const FULL: &str = "
version: v1alpha1
id: mesh-control-plane
services:
  - name: reviews
    endpoints:
      - address: 127.0.0.1:9001
        identity: reviews.default.serviceaccount.identity.cluster.local
        labels: { version: v1 }
      - address: 127.0.0.1:9002
        identity: reviews.default.serviceaccount.identity.cluster.local
        labels: { version: v2 }
  - name: legacy
    endpoints:
      - address: 127.0.0.1:9100
routes:
  - service: reviews
    splits:
      - labels: { version: v1 }
        weight: 90
      - labels: { version: v2 }
        weight: 10
    load_balancer: HASH
policies:
  - service: reviews
    mtls: PERMISSIVE
    rules:
      - action: ALLOW
        principals: ['*']
";

    #[test]
    fn parse_full_file() {
        let file = parse(FULL);
        assert_eq!(Version::V1Alpha1, file.version);
        assert_eq!(Some("mesh-control-plane"), file.id.as_deref());
        assert_eq!(2, file.services.len());
        assert!(file.validate(Some("cluster.local")).is_ok());

        let config = Config::default();
        config.apply(file, Some("cluster.local")).unwrap();

        assert_eq!("mesh-control-plane", config.id());
        assert_eq!(3, config.services.read().num_of_endpoints());
        assert_eq!(
            LoadBalancerPolicy::Hash,
            config.routes.load().get("reviews").load_balancer
        );
        assert_eq!(
            MtlsMode::Permissive,
            config.policies.load().mtls_mode("reviews")
        );
    }

    #[test]
    fn parse_default_values() {
        let file = parse("services: []");
        assert_eq!(Version::V1Alpha1, file.version);
        assert!(file.id.is_none());
        assert!(file.routes.is_empty());
        assert!(Config::default().id().starts_with("trellis-"));
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(ConfigFile::from_reader("filters: []".as_bytes()).is_err());
        assert!(ConfigFile::from_reader("version: v2".as_bytes()).is_err());
    }

    #[test]
    fn validate() {
        let yaml = "
# Non unique service names.
services:
  - name: a
  - name: a
";
        assert_eq!(
            ValidationError::NotUnique("services.name".into()).to_string(),
            parse(yaml).validate(None).unwrap_err().to_string()
        );

        let yaml = "
# Non unique endpoint addresses.
services:
  - name: a
    endpoints:
      - address: 127.0.0.1:25999
      - address: 127.0.0.1:25999
        labels: { version: v2 }
";
        assert_eq!(
            ValidationError::NotUnique("services.a.endpoints.address (127.0.0.1:25999)".into())
                .to_string(),
            parse(yaml).validate(None).unwrap_err().to_string()
        );

        let yaml = "
# Two routes for one service.
routes:
  - service: a
  - service: a
";
        assert_eq!(
            ValidationError::NotUnique("routes.service".into()).to_string(),
            parse(yaml).validate(None).unwrap_err().to_string()
        );

        let yaml = "
# Identity from another trust domain.
services:
  - name: a
    endpoints:
      - address: 127.0.0.1:25999
        identity: a.default.serviceaccount.identity.other.domain
";
        assert!(parse(yaml).validate(None).is_ok());
        assert!(matches!(
            parse(yaml).validate(Some("cluster.local")),
            Err(ValidationError::ForeignIdentity { .. })
        ));
    }

    #[test]
    fn apply_keeps_registrations_and_notifies() {
        let config = Config::default();
        let mut rx = config.services.watch();
        let registered = crate::mesh::Endpoint::new("127.0.0.1:7000".parse().unwrap());
        config
            .services
            .modify(|services| services.register("reviews", registered.clone()))
            .unwrap();
        rx.borrow_and_update();

        config.apply(parse(FULL), None).unwrap();
        assert!(rx.has_changed().unwrap());
        let endpoints = config.services.read().get("reviews").unwrap();
        assert!(endpoints.contains(&registered));
        assert_eq!(3, endpoints.len());
    }
}

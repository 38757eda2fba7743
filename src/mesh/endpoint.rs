/*
 * Copyright 2020 Google LLC
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

//! Types representing where the instances of a service can be reached.

use std::{collections::BTreeMap, net::SocketAddr};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{generated::trellis::mesh::v1 as proto, mesh::Identity};

pub type Labels = BTreeMap<String, String>;

/// A single instance of a service.
///
/// An endpoint with an identity is a mesh workload: it is reached over mTLS
/// and must present that identity. An endpoint without one is reached over
/// plain TCP.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    pub address: SocketAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
}

impl Endpoint {
    /// Creates a new plaintext [`Endpoint`] with no labels.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            identity: None,
            labels: <_>::default(),
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = (String, String)>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// Whether this endpoint carries every label in `selector`.
    pub fn matches_labels(&self, selector: &Labels) -> bool {
        selector
            .iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(address: SocketAddr) -> Self {
        Self::new(address)
    }
}

impl From<Endpoint> for proto::Endpoint {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            address: endpoint.address.to_string(),
            identity: endpoint
                .identity
                .map(|identity| identity.to_string())
                .unwrap_or_default(),
            labels: endpoint.labels.into_iter().collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid endpoint address `{address}`: {source}")]
    Address {
        address: String,
        source: std::net::AddrParseError,
    },
    #[error(transparent)]
    Identity(#[from] crate::mesh::identity::IdentityError),
}

impl TryFrom<proto::Endpoint> for Endpoint {
    type Error = EndpointError;

    fn try_from(endpoint: proto::Endpoint) -> Result<Self, Self::Error> {
        let address = endpoint
            .address
            .parse()
            .map_err(|source| EndpointError::Address {
                address: endpoint.address.clone(),
                source,
            })?;

        let identity = if endpoint.identity.is_empty() {
            None
        } else {
            Some(endpoint.identity.parse()?)
        };

        Ok(Self {
            address,
            identity,
            labels: endpoint.labels.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn label_selection() {
        let endpoint = Endpoint::new("127.0.0.1:8080".parse().unwrap())
            .with_labels(labels(&[("version", "v2"), ("zone", "a")]));

        assert!(endpoint.matches_labels(&Labels::new()));
        assert!(endpoint.matches_labels(&labels(&[("version", "v2")])));
        assert!(!endpoint.matches_labels(&labels(&[("version", "v1")])));
        assert!(!endpoint.matches_labels(&labels(&[("version", "v2"), ("tier", "gold")])));
    }

    #[test]
    fn from_proto_rejects_bad_addresses() {
        let endpoint = proto::Endpoint {
            address: "not-an-address".into(),
            ..<_>::default()
        };
        assert!(matches!(
            Endpoint::try_from(endpoint),
            Err(EndpointError::Address { .. })
        ));

        let endpoint = proto::Endpoint {
            address: "10.0.0.4:9000".into(),
            identity: "checkout.shop.serviceaccount.identity.cluster.local".into(),
            labels: [("version".to_owned(), "v1".to_owned())].into(),
        };
        let endpoint = Endpoint::try_from(endpoint).unwrap();
        assert_eq!("checkout", endpoint.identity.as_ref().unwrap().account());
        assert_eq!(Some("v1"), endpoint.labels.get("version").map(String::as_str));
    }

    #[test]
    fn yaml() {
        let endpoint: Endpoint = serde_yaml::from_str(
            "
address: 127.0.0.1:9001
identity: reviews.default.serviceaccount.identity.cluster.local
labels:
  version: v3
",
        )
        .unwrap();

        assert_eq!("127.0.0.1:9001", endpoint.address.to_string());
        assert!(endpoint.identity.is_some());
        assert!(serde_yaml::from_str::<Endpoint>("address: 127.0.0.1:1\nport: 2").is_err());
    }
}

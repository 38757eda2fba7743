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

//! Inbound security policies: mTLS requirements and authorization rules.

use std::{collections::BTreeMap, net::IpAddr};

use ipnetwork::IpNetwork;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    config::error::{ValidationError, ValueInvalidArgs},
    generated::trellis::mesh::v1 as proto,
    mesh::{Identity, PrincipalMatcher},
};

/// Whether a service's inbound listener requires mutual TLS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum MtlsMode {
    /// Only mTLS connections are accepted.
    #[default]
    #[serde(rename = "STRICT")]
    Strict,
    /// Both mTLS and plaintext connections are accepted.
    #[serde(rename = "PERMISSIVE")]
    Permissive,
    /// Only plaintext connections are accepted.
    #[serde(rename = "DISABLE")]
    Disable,
}

impl MtlsMode {
    pub fn accepts_tls(self) -> bool {
        !matches!(self, Self::Disable)
    }

    pub fn accepts_plaintext(self) -> bool {
        !matches!(self, Self::Strict)
    }
}

/// Whether a matching [`Rule`] allows or denies the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Action {
    #[serde(rename = "ALLOW")]
    Allow,
    #[serde(rename = "DENY")]
    Deny,
}

/// The peer of an inbound connection, as far as policy is concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// The identity from the peer's client certificate, `None` for plaintext.
    pub identity: Option<Identity>,
    pub address: IpAddr,
}

/// Matches peers by identity and source address. An empty list matches
/// everything.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<PrincipalMatcher>,
    /// IPv4 or IPv6 CIDR ranges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(with = "Vec<String>")]
    pub sources: Vec<IpNetwork>,
}

impl Rule {
    /// Returns `true` if `peer` matches the rule.
    ///
    /// # Examples
    /// ```
    /// use trellis::mesh::policy::{Action, Peer, Rule};
    ///
    /// let rule = Rule {
    ///     action: Action::Allow,
    ///     principals: vec!["*.shop.serviceaccount.identity.cluster.local".parse().unwrap()],
    ///     sources: vec!["10.0.0.0/8".parse().unwrap()],
    /// };
    ///
    /// let peer = Peer {
    ///     identity: "cart.shop.serviceaccount.identity.cluster.local".parse().ok(),
    ///     address: [10, 1, 2, 3].into(),
    /// };
    /// assert!(rule.matches(&peer));
    ///
    /// // Principals never match plaintext peers.
    /// assert!(!rule.matches(&Peer { identity: None, ..peer.clone() }));
    /// assert!(!rule.matches(&Peer { address: [192, 168, 0, 1].into(), ..peer }));
    /// ```
    pub fn matches(&self, peer: &Peer) -> bool {
        let principal_matches = self.principals.is_empty()
            || peer.identity.as_ref().map_or(false, |identity| {
                self.principals
                    .iter()
                    .any(|principal| principal.matches(identity))
            });

        let source_matches = self.sources.is_empty()
            || self
                .sources
                .iter()
                .any(|network| network.contains(peer.address));

        principal_matches && source_matches
    }
}

/// The inbound policy of a single service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub service: String,
    #[serde(default)]
    pub mtls: MtlsMode,
    /// Evaluated in order, the first matching rule decides. If there are
    /// rules and none match, the connection is denied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
}

/// The result of authorizing a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Denied by the rule at the given index.
    DenyByRule(usize),
    /// Denied because no rule matched.
    DenyByDefault,
    /// Denied because the connection was plaintext and the service requires
    /// mTLS.
    DenyPlaintext,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

impl Policy {
    /// The policy applied to services without one: strict mTLS, any
    /// authenticated peer allowed.
    pub fn default_for(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            mtls: MtlsMode::Strict,
            rules: Vec::new(),
        }
    }

    pub fn authorize(&self, peer: &Peer) -> Decision {
        if peer.identity.is_none() && !self.mtls.accepts_plaintext() {
            return Decision::DenyPlaintext;
        }

        if self.rules.is_empty() {
            return Decision::Allow;
        }

        for (index, rule) in self.rules.iter().enumerate() {
            if rule.matches(peer) {
                tracing::trace!(service = %self.service, index, action = ?rule.action, "policy rule matched");
                return match rule.action {
                    Action::Allow => Decision::Allow,
                    Action::Deny => Decision::DenyByRule(index),
                };
            }
        }

        Decision::DenyByDefault
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.service.is_empty() {
            return Err(ValueInvalidArgs {
                field: "policies.service".into(),
                clarification: Some("a policy must name the service it applies to".into()),
                examples: None,
            }
            .into());
        }

        Ok(())
    }
}

/// Every policy known to the mesh, keyed by service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "Vec<Policy>", into = "Vec<Policy>")]
pub struct PolicySet(BTreeMap<String, Policy>);

impl JsonSchema for PolicySet {
    fn schema_name() -> String {
        <Vec<Policy>>::schema_name()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        <Vec<Policy>>::json_schema(gen)
    }
}

impl PolicySet {
    /// The policy for `service`, or the default policy if none was configured.
    pub fn get(&self, service: &str) -> Policy {
        self.0
            .get(service)
            .cloned()
            .unwrap_or_else(|| Policy::default_for(service))
    }

    pub fn mtls_mode(&self, service: &str) -> MtlsMode {
        self.0
            .get(service)
            .map_or(MtlsMode::default(), |policy| policy.mtls)
    }

    pub fn authorize(&self, service: &str, peer: &Peer) -> Decision {
        match self.0.get(service) {
            Some(policy) => policy.authorize(peer),
            None => Policy::default_for(service).authorize(peer),
        }
    }

    pub fn contains(&self, service: &str) -> bool {
        self.0.contains_key(service)
    }

    pub fn insert(&mut self, policy: Policy) {
        self.0.insert(policy.service.clone(), policy);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.0.values()
    }
}

impl From<Vec<Policy>> for PolicySet {
    fn from(policies: Vec<Policy>) -> Self {
        Self(
            policies
                .into_iter()
                .map(|policy| (policy.service.clone(), policy))
                .collect(),
        )
    }
}

impl From<PolicySet> for Vec<Policy> {
    fn from(set: PolicySet) -> Self {
        set.0.into_values().collect()
    }
}

impl From<Policy> for proto::Policy {
    fn from(policy: Policy) -> Self {
        let mtls = match policy.mtls {
            MtlsMode::Strict => proto::policy::MtlsMode::Strict,
            MtlsMode::Permissive => proto::policy::MtlsMode::Permissive,
            MtlsMode::Disable => proto::policy::MtlsMode::Disable,
        };

        Self {
            service: policy.service,
            mtls: mtls.into(),
            rules: policy
                .rules
                .into_iter()
                .map(|rule| {
                    let action = match rule.action {
                        Action::Allow => proto::policy::rule::Action::Allow,
                        Action::Deny => proto::policy::rule::Action::Deny,
                    };
                    proto::policy::Rule {
                        action: action.into(),
                        principals: rule.principals.iter().map(ToString::to_string).collect(),
                        sources: rule.sources.iter().map(ToString::to_string).collect(),
                    }
                })
                .collect(),
        }
    }
}

impl TryFrom<proto::Policy> for Policy {
    type Error = ValidationError;

    fn try_from(policy: proto::Policy) -> Result<Self, Self::Error> {
        let invalid = |field: &str, clarification: String| -> ValidationError {
            ValueInvalidArgs {
                field: format!("policies.{}.{field}", policy.service),
                clarification: Some(clarification),
                examples: None,
            }
            .into()
        };

        let mtls = match proto::policy::MtlsMode::try_from(policy.mtls) {
            Ok(proto::policy::MtlsMode::Strict) => MtlsMode::Strict,
            Ok(proto::policy::MtlsMode::Permissive) => MtlsMode::Permissive,
            Ok(proto::policy::MtlsMode::Disable) => MtlsMode::Disable,
            Err(_) => return Err(invalid("mtls", format!("unknown mode {}", policy.mtls))),
        };

        let mut rules = Vec::with_capacity(policy.rules.len());
        for rule in &policy.rules {
            let action = match proto::policy::rule::Action::try_from(rule.action) {
                Ok(proto::policy::rule::Action::Allow) => Action::Allow,
                Ok(proto::policy::rule::Action::Deny) => Action::Deny,
                Err(_) => {
                    return Err(invalid(
                        "rules.action",
                        format!("unknown action {}", rule.action),
                    ))
                }
            };

            let principals = rule
                .principals
                .iter()
                .map(|principal| principal.parse())
                .collect::<Result<_, _>>()
                .map_err(|error: crate::mesh::identity::IdentityError| {
                    invalid("rules.principals", error.to_string())
                })?;

            let sources = rule
                .sources
                .iter()
                .map(|source| source.parse())
                .collect::<Result<_, _>>()
                .map_err(|error: ipnetwork::IpNetworkError| {
                    invalid("rules.sources", error.to_string())
                })?;

            rules.push(Rule {
                action,
                principals,
                sources,
            });
        }

        let policy = Self {
            service: policy.service.clone(),
            mtls,
            rules,
        };
        policy.validate()?;
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn peer(identity: Option<&str>, address: [u8; 4]) -> Peer {
        Peer {
            identity: identity.map(|identity| identity.parse().unwrap()),
            address: address.into(),
        }
    }

    const CART: &str = "cart.shop.serviceaccount.identity.cluster.local";
    const ADMIN: &str = "admin.ops.serviceaccount.identity.cluster.local";

    #[test]
    fn default_policy_requires_mtls() {
        let set = PolicySet::default();
        assert_eq!(
            Decision::Allow,
            set.authorize("payments", &peer(Some(CART), [10, 0, 0, 1]))
        );
        assert_eq!(
            Decision::DenyPlaintext,
            set.authorize("payments", &peer(None, [10, 0, 0, 1]))
        );
        assert_eq!(MtlsMode::Strict, set.mtls_mode("payments"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy: Policy = serde_yaml::from_str(&format!(
            "
service: payments
mtls: PERMISSIVE
rules:
  - action: DENY
    principals: [{ADMIN}]
  - action: ALLOW
    principals: ['*.shop.serviceaccount.identity.cluster.local']
  - action: ALLOW
    sources: [192.168.0.0/16]
"
        ))
        .unwrap();

        assert_eq!(
            Decision::DenyByRule(0),
            policy.authorize(&peer(Some(ADMIN), [192, 168, 1, 1]))
        );
        assert_eq!(
            Decision::Allow,
            policy.authorize(&peer(Some(CART), [10, 0, 0, 1]))
        );
        assert_eq!(
            Decision::Allow,
            policy.authorize(&peer(None, [192, 168, 4, 4]))
        );
        assert_eq!(
            Decision::DenyByDefault,
            policy.authorize(&peer(None, [10, 0, 0, 1]))
        );
    }

    #[test]
    fn modes() {
        assert!(MtlsMode::Strict.accepts_tls() && !MtlsMode::Strict.accepts_plaintext());
        assert!(MtlsMode::Permissive.accepts_tls() && MtlsMode::Permissive.accepts_plaintext());
        assert!(!MtlsMode::Disable.accepts_tls() && MtlsMode::Disable.accepts_plaintext());
    }

    #[test]
    fn proto_conversion_validates_rules() {
        let policy = Policy {
            service: "payments".into(),
            mtls: MtlsMode::Permissive,
            rules: vec![Rule {
                action: Action::Deny,
                principals: vec!["*".parse().unwrap()],
                sources: vec!["10.0.0.0/8".parse().unwrap()],
            }],
        };
        let proto = proto::Policy::from(policy.clone());
        assert_eq!(policy, Policy::try_from(proto.clone()).unwrap());

        let mut broken = proto;
        broken.rules[0].sources = vec!["10.0.0.0/64".into()];
        assert!(Policy::try_from(broken).is_err());
    }
}

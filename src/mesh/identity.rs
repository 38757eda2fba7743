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

//! Workload identities and the matchers policies use to select them.

use std::{fmt, str::FromStr};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The label sequence separating an identity's account from its trust domain.
pub const IDENTITY_MARKER: &str = "serviceaccount.identity";
pub const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity `{0}` is missing the `.{IDENTITY_MARKER}.` marker")]
    MissingMarker(String),
    #[error("identity `{0}` must be of the form `<account>.<namespace>.{IDENTITY_MARKER}.<trust domain>`")]
    Malformed(String),
    #[error("`{0}` is not a valid DNS label")]
    InvalidLabel(String),
    #[error("principal `{0}` uses a wildcard anywhere other than a leading `*.`")]
    InvalidWildcard(String),
}

/// The authenticated name of a workload.
///
/// Identities are rendered as DNS names,
/// `<account>.<namespace>.serviceaccount.identity.<trust domain>`, and carried
/// as a DNS subject alternative name in workload certificates so that TLS
/// server name verification authenticates the peer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity {
    account: String,
    namespace: String,
    trust_domain: String,
}

impl Identity {
    pub fn new(
        account: impl Into<String>,
        namespace: impl Into<String>,
        trust_domain: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let identity = Self {
            account: account.into(),
            namespace: namespace.into(),
            trust_domain: trust_domain.into(),
        };

        validate_label(&identity.account)?;
        validate_label(&identity.namespace)?;
        for label in identity.trust_domain.split('.') {
            validate_label(label)?;
        }

        Ok(identity)
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    pub fn in_trust_domain(&self, trust_domain: &str) -> bool {
        self.trust_domain == trust_domain
    }
}

fn validate_label(label: &str) -> Result<(), IdentityError> {
    let valid = !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');

    if valid {
        Ok(())
    } else {
        Err(IdentityError::InvalidLabel(label.into()))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{IDENTITY_MARKER}.{}",
            self.account, self.namespace, self.trust_domain
        )
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let marker = format!(".{IDENTITY_MARKER}.");
        let (workload, trust_domain) = input
            .split_once(&marker)
            .ok_or_else(|| IdentityError::MissingMarker(input.into()))?;

        let (account, namespace) = workload
            .split_once('.')
            .filter(|(_, namespace)| !namespace.contains('.'))
            .ok_or_else(|| IdentityError::Malformed(input.into()))?;

        Self::new(account, namespace, trust_domain)
    }
}

impl Serialize for Identity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let input = String::deserialize(deserializer)?;
        input.parse().map_err(serde::de::Error::custom)
    }
}

impl JsonSchema for Identity {
    fn schema_name() -> String {
        "Identity".into()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

/// Selects the identities a policy rule applies to.
///
/// * `*` matches every authenticated identity.
/// * `*.<suffix>` matches identities whose name ends with `.<suffix>`, e.g.
///   `*.payments.serviceaccount.identity.cluster.local` for a namespace.
/// * anything else must be a complete identity and matches exactly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrincipalMatcher {
    Any,
    Suffix(String),
    Exact(Identity),
}

impl PrincipalMatcher {
    pub fn matches(&self, identity: &Identity) -> bool {
        match self {
            Self::Any => true,
            Self::Suffix(suffix) => identity.to_string().ends_with(suffix.as_str()),
            Self::Exact(expected) => expected == identity,
        }
    }
}

impl fmt::Display for PrincipalMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Suffix(suffix) => write!(f, "*{suffix}"),
            Self::Exact(identity) => identity.fmt(f),
        }
    }
}

impl FromStr for PrincipalMatcher {
    type Err = IdentityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input == "*" {
            return Ok(Self::Any);
        }

        match input.strip_prefix('*') {
            Some(suffix) if suffix.starts_with('.') && !suffix[1..].contains('*') => {
                if suffix.len() == 1 {
                    return Err(IdentityError::InvalidWildcard(input.into()));
                }
                Ok(Self::Suffix(suffix.into()))
            }
            Some(_) => Err(IdentityError::InvalidWildcard(input.into())),
            None if input.contains('*') => Err(IdentityError::InvalidWildcard(input.into())),
            None => input.parse().map(Self::Exact),
        }
    }
}

impl Serialize for PrincipalMatcher {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PrincipalMatcher {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let input = String::deserialize(deserializer)?;
        input.parse().map_err(serde::de::Error::custom)
    }
}

impl JsonSchema for PrincipalMatcher {
    fn schema_name() -> String {
        "PrincipalMatcher".into()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

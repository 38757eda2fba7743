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

use std::net::SocketAddr;

use crate::{mesh::policy::Decision, telemetry::Outcome};

/// Why a proxied connection could not be established.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no healthy upstream for service `{0}`")]
    NoUpstream(String),
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[error("timed out connecting to {0}")]
    Timeout(SocketAddr),
    #[error("TLS handshake with {address} failed: {source}")]
    Tls {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[error("no workload certificate has been issued yet")]
    NoCertificate,
    #[error("connection denied by policy: {0:?}")]
    Denied(Decision),
    #[error("plaintext connection rejected, mTLS is required")]
    PlaintextRejected,
    #[error("TLS connection rejected, mTLS is disabled")]
    TlsDisabled,
    #[error("OS level error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// The telemetry outcome of a connection that failed with this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::NoUpstream(_) => Outcome::NoUpstream,
            Self::Connect { .. } | Self::Timeout(_) | Self::Io(_) => Outcome::ConnectFailure,
            Self::Tls { .. } | Self::NoCertificate | Self::TlsDisabled => Outcome::TlsFailure,
            Self::Denied(_) | Self::PlaintextRejected => Outcome::Denied,
        }
    }

    /// Whether the error says something about the upstream endpoint's
    /// health, as opposed to the local sidecar or the client.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout(_) | Self::Tls { .. }
        )
    }

    pub fn discriminant(&self) -> &'static str {
        match self {
            Self::NoUpstream(_) => "no upstream",
            Self::Connect { .. } => "connect",
            Self::Timeout(_) => "timeout",
            Self::Tls { .. } => "tls",
            Self::NoCertificate => "no certificate",
            Self::Denied(_) => "denied",
            Self::PlaintextRejected => "plaintext rejected",
            Self::TlsDisabled => "tls disabled",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes() {
        let address = SocketAddr::from(([127, 0, 0, 1], 80));
        assert_eq!(Outcome::NoUpstream, ProxyError::NoUpstream("reviews".into()).outcome());
        assert_eq!(Outcome::ConnectFailure, ProxyError::Timeout(address).outcome());
        assert_eq!(Outcome::TlsFailure, ProxyError::NoCertificate.outcome());
        assert_eq!(
            Outcome::Denied,
            ProxyError::Denied(Decision::DenyByDefault).outcome()
        );

        assert!(ProxyError::Timeout(address).is_endpoint_failure());
        assert!(!ProxyError::NoCertificate.is_endpoint_failure());
    }
}

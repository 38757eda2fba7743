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

use std::{
    net::{Ipv6Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use crate::{
    components::{admin::IDLE_REQUEST_INTERVAL, control_plane, RunArgs},
    mesh::identity::DEFAULT_TRUST_DOMAIN,
    pki::{authority::DEFAULT_MAX_CERTIFICATE_TTL, CertificateAuthority},
    signal::ShutdownRx,
};

pub const PORT: u16 = 7800;

/// Run Trellis as the mesh control plane: registry, discovery, certificate
/// authority and telemetry aggregation.
#[derive(clap::Args, Clone, Debug)]
pub struct ControlPlane {
    /// The port to listen on.
    #[clap(short, long, env = "TRELLIS_PORT", default_value_t = PORT)]
    pub port: u16,
    #[clap(long, env = "TRELLIS_TRUST_DOMAIN", default_value = DEFAULT_TRUST_DOMAIN)]
    pub trust_domain: String,
    /// PEM encoded root certificate. A root is generated when absent.
    #[clap(long, env = "TRELLIS_CA_CERT", requires("ca_key"))]
    pub ca_cert: Option<PathBuf>,
    /// PEM encoded private key of the root certificate.
    #[clap(long, env = "TRELLIS_CA_KEY", requires("ca_cert"))]
    pub ca_key: Option<PathBuf>,
    #[clap(long, env = "TRELLIS_MAX_CERTIFICATE_TTL_SECS", default_value_t = DEFAULT_MAX_CERTIFICATE_TTL.as_secs())]
    pub max_certificate_ttl_secs: u64,
    /// Token sidecars must present to obtain certificates.
    #[clap(long, env = "TRELLIS_BOOTSTRAP_TOKEN")]
    pub bootstrap_token: Option<String>,
    #[clap(long, env = "TRELLIS_IDLE_REQUEST_INTERVAL_SECS", value_parser = clap::value_parser!(u64).range(1..), default_value_t = IDLE_REQUEST_INTERVAL.as_secs())]
    pub idle_request_interval_secs: u64,
}

impl ControlPlane {
    pub fn ready(&self) -> control_plane::Ready {
        control_plane::Ready {
            idle_request_interval: Duration::from_secs(self.idle_request_interval_secs),
            ..<_>::default()
        }
    }

    /// Loads the root from `--ca-cert`/`--ca-key`, or generates one.
    pub async fn authority(&self) -> crate::Result<CertificateAuthority> {
        let authority = match (&self.ca_cert, &self.ca_key) {
            (Some(cert), Some(key)) => {
                let cert = tokio::fs::read_to_string(cert).await?;
                let key = tokio::fs::read_to_string(key).await?;
                CertificateAuthority::from_pem(&cert, &key, &*self.trust_domain)?
            }
            _ => {
                tracing::info!(trust_domain = %self.trust_domain, "generating self-signed root certificate");
                CertificateAuthority::generate(&*self.trust_domain)?
            }
        };

        let authority =
            authority.with_max_ttl(Duration::from_secs(self.max_certificate_ttl_secs));
        Ok(match &self.bootstrap_token {
            Some(token) => authority.with_bootstrap_token(token.clone()),
            None => authority,
        })
    }

    /// Start and run the control plane.
    pub async fn run(
        self,
        config: Arc<crate::Config>,
        config_path: Option<PathBuf>,
        ready: control_plane::Ready,
        shutdown_rx: ShutdownRx,
    ) -> crate::Result<()> {
        tracing::info!(id = %config.id(), port = self.port, "Starting control plane");

        let authority = Arc::new(self.authority().await?);
        let listener =
            crate::net::bind(SocketAddr::from((Ipv6Addr::UNSPECIFIED, self.port))).await?;

        control_plane::ControlPlane {
            listener,
            config_path,
            authority,
        }
        .run(
            RunArgs {
                config,
                ready,
                shutdown_rx,
            },
            None,
        )
        .await
    }
}

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

use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use tonic::transport::Endpoint;

use crate::{
    components::{admin::IDLE_REQUEST_INTERVAL, sidecar, RunArgs},
    mesh::{
        endpoint::Labels,
        identity::{IdentityError, DEFAULT_NAMESPACE, DEFAULT_TRUST_DOMAIN},
        Identity,
    },
    signal::ShutdownRx,
    telemetry::{record::DEFAULT_CAPACITY, reporter::DEFAULT_REPORT_INTERVAL, Recorder},
};

/// Run Trellis as the sidecar of a local application.
#[derive(clap::Args, Clone, Debug)]
pub struct Sidecar {
    /// The service the local application is an instance of.
    #[clap(long, env = "TRELLIS_SERVICE")]
    pub service: String,
    #[clap(long, env = "TRELLIS_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,
    /// The service account of the workload, defaults to the service name.
    #[clap(long, env = "TRELLIS_SERVICE_ACCOUNT")]
    pub service_account: Option<String>,
    #[clap(long, env = "TRELLIS_TRUST_DOMAIN", default_value = DEFAULT_TRUST_DOMAIN)]
    pub trust_domain: String,
    /// The address peers connect to.
    #[clap(long, env = "TRELLIS_INBOUND_ADDRESS", default_value = "0.0.0.0:15006")]
    pub inbound_address: SocketAddr,
    /// The address the control plane tells peers to use, defaults to the
    /// bound inbound address.
    #[clap(long, env = "TRELLIS_ADVERTISE_ADDRESS")]
    pub advertise_address: Option<SocketAddr>,
    /// The address of the local application.
    #[clap(long, env = "TRELLIS_APP_ADDRESS")]
    pub app_address: SocketAddr,
    /// A local listener for an upstream service, as `service=address`.
    #[clap(long, env = "TRELLIS_UPSTREAM", value_delimiter = ',')]
    pub upstream: Vec<UpstreamArg>,
    /// A label of this instance, as `key=value`.
    #[clap(long = "label", env = "TRELLIS_LABELS", value_delimiter = ',')]
    pub label: Vec<LabelArg>,
    /// One or more `trellis control-plane` endpoints.
    #[clap(long, env = "TRELLIS_CONTROL_PLANE")]
    pub control_plane: Vec<Endpoint>,
    /// Token presented with certificate requests.
    #[clap(long, env = "TRELLIS_CA_TOKEN", default_value = "")]
    pub ca_token: String,
    /// Requested certificate lifetime, `0` leaves it to the authority.
    #[clap(long, env = "TRELLIS_CERTIFICATE_TTL_SECS", default_value_t = 0)]
    pub certificate_ttl_secs: u64,
    #[clap(long, env = "TRELLIS_REPORT_INTERVAL_SECS", value_parser = clap::value_parser!(u64).range(1..), default_value_t = DEFAULT_REPORT_INTERVAL.as_secs())]
    pub report_interval_secs: u64,
    #[clap(long, env = "TRELLIS_IDLE_REQUEST_INTERVAL_SECS", value_parser = clap::value_parser!(u64).range(1..), default_value_t = IDLE_REQUEST_INTERVAL.as_secs())]
    pub idle_request_interval_secs: u64,
}

impl Sidecar {
    pub fn identity(&self) -> Result<Identity, IdentityError> {
        Identity::new(
            self.service_account.as_deref().unwrap_or(&self.service),
            &*self.namespace,
            &*self.trust_domain,
        )
    }

    pub fn labels(&self) -> Labels {
        self.label
            .iter()
            .map(|label| (label.key.clone(), label.value.clone()))
            .collect()
    }

    pub fn ready(&self) -> sidecar::Ready {
        sidecar::Ready {
            idle_request_interval: Duration::from_secs(self.idle_request_interval_secs),
            ..<_>::default()
        }
    }

    /// Start and run a sidecar.
    #[tracing::instrument(skip_all, fields(service = %self.service))]
    pub async fn run(
        self,
        config: Arc<crate::Config>,
        ready: sidecar::Ready,
        shutdown_rx: ShutdownRx,
    ) -> crate::Result<()> {
        let identity = self.identity()?;
        let labels = self.labels();
        tracing::info!(sidecar_id = %config.id(), %identity, "Starting sidecar");

        let inbound = crate::net::bind(self.inbound_address).await?;
        let mut upstreams = Vec::with_capacity(self.upstream.len());
        for upstream in self.upstream {
            upstreams.push(sidecar::Upstream {
                listener: crate::net::bind(upstream.address).await?,
                service: upstream.service,
            });
        }

        if self.control_plane.is_empty() {
            tracing::warn!("no control plane configured, mTLS and telemetry reporting are disabled");
        }

        sidecar::Sidecar {
            service: self.service,
            identity,
            labels,
            inbound,
            advertise_address: self.advertise_address,
            app_address: self.app_address,
            upstreams,
            management_servers: self.control_plane,
            ca_token: self.ca_token,
            certificate_ttl: Duration::from_secs(self.certificate_ttl_secs),
            report_interval: Duration::from_secs(self.report_interval_secs),
            recorder: Recorder::new(DEFAULT_CAPACITY),
            tls: <_>::default(),
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

/// `service=address`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamArg {
    pub service: String,
    pub address: SocketAddr,
}

impl FromStr for UpstreamArg {
    type Err = eyre::Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let Some((service, address)) = input.split_once('=') else {
            eyre::bail!("upstream `{input}` is invalid, it must be `service=address`")
        };

        if service.is_empty() {
            eyre::bail!("upstream `{input}` is missing a service name");
        }

        Ok(Self {
            service: service.into(),
            address: address.parse()?,
        })
    }
}

/// `key=value`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelArg {
    pub key: String,
    pub value: String,
}

impl FromStr for LabelArg {
    type Err = eyre::Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(Self {
                key: key.into(),
                value: value.into(),
            }),
            _ => eyre::bail!("label `{input}` is invalid, it must be `key=value`"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_upstream() {
        assert_eq!(
            UpstreamArg {
                service: "ratings".into(),
                address: "127.0.0.1:15001".parse().unwrap(),
            },
            "ratings=127.0.0.1:15001".parse().unwrap()
        );
        assert!("ratings".parse::<UpstreamArg>().is_err());
        assert!("=127.0.0.1:15001".parse::<UpstreamArg>().is_err());
        assert!("ratings=nowhere".parse::<UpstreamArg>().is_err());
    }

    #[test]
    fn parse_label() {
        let label: LabelArg = "version=v1".parse().unwrap();
        assert_eq!(("version", "v1"), (&*label.key, &*label.value));
        assert!("version".parse::<LabelArg>().is_err());
        assert!("=v1".parse::<LabelArg>().is_err());
    }
}

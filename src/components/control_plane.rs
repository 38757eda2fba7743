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
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::TryFutureExt as _;
use tokio::net::TcpListener;

use super::RunArgs;
use crate::{
    net::xds::ControlPlane as DiscoveryServer,
    pki::{proto::certificate_service_server::CertificateServiceServer, CertificateAuthority},
    telemetry::{proto::telemetry_service_server::TelemetryServiceServer, Aggregator},
};

const PROVIDER_RETRIES: u32 = 25;
const PROVIDER_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct Ready {
    pub idle_request_interval: Duration,
    pub provider_is_healthy: Arc<AtomicBool>,
    /// Shared with the admin server, which renders it as the service graph.
    pub aggregator: Arc<Aggregator>,
}

impl Default for Ready {
    fn default() -> Self {
        Self {
            idle_request_interval: crate::components::admin::IDLE_REQUEST_INTERVAL,
            provider_is_healthy: Default::default(),
            aggregator: Default::default(),
        }
    }
}

impl Ready {
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.provider_is_healthy.load(Ordering::SeqCst)
    }
}

/// Serves discovery, certificate signing and telemetry ingestion on a single
/// gRPC listener.
pub struct ControlPlane {
    pub listener: TcpListener,
    /// The mesh configuration file, watched for changes.
    pub config_path: Option<PathBuf>,
    pub authority: Arc<CertificateAuthority>,
}

impl ControlPlane {
    #[tracing::instrument(skip_all)]
    pub async fn run(
        self,
        RunArgs {
            config,
            ready,
            mut shutdown_rx,
        }: RunArgs<Ready>,
        initialized: Option<tokio::sync::oneshot::Sender<()>>,
    ) -> crate::Result<()> {
        let trust_domain = self.authority.trust_domain().to_owned();

        let provider_task = match self.config_path {
            Some(path) => {
                let config = config.clone();
                let health = ready.provider_is_healthy.clone();
                let task = tryhard::retry_fn(move || {
                    tokio::spawn(crate::config::watch::fs::watch(
                        config.clone(),
                        health.clone(),
                        path.clone(),
                        Some(trust_domain.clone()),
                    ))
                    .map_err(eyre::Error::from)
                    .and_then(std::future::ready)
                })
                .retries(PROVIDER_RETRIES)
                .exponential_backoff(PROVIDER_BACKOFF)
                .on_retry(|_, _, error| {
                    let error = error.to_string();
                    async move {
                        tracing::warn!(%error, "provider task error, retrying");
                    }
                });
                futures::future::Either::Left(task)
            }
            None => {
                tracing::info!("no configuration file, serving registrations only");
                ready.provider_is_healthy.store(true, Ordering::SeqCst);
                futures::future::Either::Right(std::future::pending())
            }
        };

        let address = self.listener.local_addr()?;
        let discovery = DiscoveryServer::from_arc(config.clone());
        let server = tonic::transport::Server::builder()
            .add_service(discovery.into_service())
            .add_service(CertificateServiceServer::from_arc(self.authority.clone()))
            .add_service(TelemetryServiceServer::from_arc(ready.aggregator.clone()))
            .serve_with_incoming_shutdown(
                tokio_stream::wrappers::TcpListenerStream::new(self.listener),
                {
                    let mut shutdown_rx = shutdown_rx.clone();
                    async move { crate::signal::wait_for(&mut shutdown_rx).await }
                },
            );

        tracing::info!(
            %address,
            trust_domain = self.authority.trust_domain(),
            "Trellis control plane is ready"
        );
        if let Some(initialized) = initialized {
            let _ = initialized.send(());
        }

        tokio::select! {
            result = server => result.map_err(From::from),
            result = provider_task => result,
            _ = crate::signal::wait_for(&mut shutdown_rx) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        mesh::Endpoint,
        signal::ShutdownKind,
        test::{available_addr, eventually},
    };

    #[tokio::test]
    async fn applies_file_and_serves_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trellis.yaml");
        std::fs::write(
            &path,
            r#"
version: v1alpha1
services:
  - name: reviews
    endpoints:
      - address: 127.0.0.1:9080
"#,
        )
        .unwrap();

        let config = Arc::new(Config::default());
        let ready = Ready::default();
        let listener = TcpListener::bind(available_addr().await).await.unwrap();
        let address = listener.local_addr().unwrap();
        let authority = Arc::new(CertificateAuthority::generate("cluster.local").unwrap());

        let (_shutdown_tx, shutdown_rx) = crate::signal::channel(ShutdownKind::Testing);
        let (initialized_tx, initialized_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(
            ControlPlane {
                listener,
                config_path: Some(path),
                authority: authority.clone(),
            }
            .run(
                RunArgs {
                    config: config.clone(),
                    ready: ready.clone(),
                    shutdown_rx,
                },
                Some(initialized_tx),
            ),
        );
        initialized_rx.await.unwrap();

        eventually("config file applied", || ready.is_ready()).await;
        assert_eq!(
            Some([Endpoint::new("127.0.0.1:9080".parse().unwrap())].into()),
            config.services.read().get("reviews")
        );

        let tls = crate::pki::SharedTls::default();
        let rotator = crate::pki::Rotator::new(
            crate::test::identity_in("reviews", "cluster.local"),
            vec![format!("http://{address}").parse().unwrap()],
            tls,
        );
        let certificate = rotator.request().await.unwrap();
        assert_eq!("reviews", certificate.identity().account());
        assert_eq!(authority.trust_bundle_pem(), certificate.trust_bundle_pem());
    }

    #[tokio::test]
    async fn ready_without_config_file() {
        let ready = Ready::default();
        let listener = TcpListener::bind(available_addr().await).await.unwrap();
        let (shutdown_tx, shutdown_rx) = crate::signal::channel(ShutdownKind::Testing);

        let handle = tokio::spawn(
            ControlPlane {
                listener,
                config_path: None,
                authority: Arc::new(CertificateAuthority::generate("cluster.local").unwrap()),
            }
            .run(
                RunArgs {
                    config: Arc::new(Config::default()),
                    ready: ready.clone(),
                    shutdown_rx,
                },
                None,
            ),
        );

        eventually("ready", || ready.is_ready()).await;
        shutdown_tx.send(ShutdownKind::Normal).unwrap();
        handle.await.unwrap().unwrap();
    }
}

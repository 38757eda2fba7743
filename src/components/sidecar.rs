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

pub(crate) mod error;
mod inbound;
pub(crate) mod metrics;
mod outbound;
pub mod outlier;
pub mod router;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::net::TcpListener;
use tracing::Instrument;

pub use self::{error::ProxyError, outlier::OutlierDetector, router::Router};
use super::RunArgs;
use crate::{
    config::Config,
    mesh::{endpoint::Labels, Identity},
    net::xds::{proto::Node, Client},
    pki::{Rotator, SharedTls},
    telemetry::{ConnectionRecord, Recorder, Reporter},
};

#[derive(Clone, Debug)]
pub struct Ready {
    pub idle_request_interval: Duration,
    // RwLock as these checks are conditional on the sidecar using a control plane.
    pub xds_is_healthy: Arc<parking_lot::RwLock<Option<Arc<AtomicBool>>>>,
    pub tls: Arc<parking_lot::RwLock<Option<SharedTls>>>,
}

impl Default for Ready {
    fn default() -> Self {
        Self {
            idle_request_interval: crate::components::admin::IDLE_REQUEST_INTERVAL,
            xds_is_healthy: Default::default(),
            tls: Default::default(),
        }
    }
}

impl Ready {
    /// Ready once the discovery stream is healthy and a workload certificate
    /// is loaded, for whichever of the two are in use.
    pub fn is_ready(&self) -> bool {
        let xds_healthy = self
            .xds_is_healthy
            .read()
            .as_ref()
            .map_or(true, |health| health.load(Ordering::SeqCst));
        let tls_loaded = self
            .tls
            .read()
            .as_ref()
            .map_or(true, |tls| tls.load().is_some());

        xds_healthy && tls_loaded
    }
}

/// A local port the application connects to in order to reach `service`.
pub struct Upstream {
    pub service: String,
    pub listener: TcpListener,
}

/// State shared by every connection a sidecar handles.
pub(crate) struct Context {
    pub config: Arc<Config>,
    pub service: String,
    pub identity: Identity,
    pub app_address: SocketAddr,
    pub tls: SharedTls,
    pub recorder: Recorder,
    pub router: Router,
    pub outliers: OutlierDetector,
}

impl Context {
    /// Hands a finished connection to metrics and telemetry.
    pub fn finish(&self, record: ConnectionRecord) {
        tracing::trace!(outcome = ?record.outcome, attempts = record.attempts, "connection finished");
        metrics::observe(&record);
        self.recorder.record(record);
    }
}

pub struct Sidecar {
    pub service: String,
    pub identity: Identity,
    pub labels: Labels,
    pub inbound: TcpListener,
    /// The address peers are told to use, defaults to the inbound listener's.
    pub advertise_address: Option<SocketAddr>,
    pub app_address: SocketAddr,
    pub upstreams: Vec<Upstream>,
    pub management_servers: Vec<tonic::transport::Endpoint>,
    pub ca_token: String,
    /// Requested certificate lifetime, zero leaving it to the authority.
    pub certificate_ttl: Duration,
    pub report_interval: Duration,
    pub recorder: Recorder,
    /// The TLS context in use, rotated in place when a control plane is
    /// configured.
    pub tls: SharedTls,
}

impl Sidecar {
    pub async fn run(
        self,
        RunArgs {
            config,
            ready,
            mut shutdown_rx,
        }: RunArgs<Ready>,
        initialized: Option<tokio::sync::oneshot::Sender<()>>,
    ) -> crate::Result<()> {
        let advertise_address = match self.advertise_address {
            Some(address) => address,
            None => self.inbound.local_addr()?,
        };

        let context = Arc::new(Context {
            config: config.clone(),
            service: self.service.clone(),
            identity: self.identity.clone(),
            app_address: self.app_address,
            tls: self.tls.clone(),
            recorder: self.recorder.clone(),
            router: Router::new(),
            outliers: OutlierDetector::default(),
        });

        let mut tasks = Vec::new();
        let mut reporter_task = None;

        if !self.management_servers.is_empty() {
            let healthy: Arc<AtomicBool> = <_>::default();
            *ready.xds_is_healthy.write() = Some(healthy.clone());
            *ready.tls.write() = Some(self.tls.clone());

            let node = Node {
                id: config.id(),
                service: self.service.clone(),
                address: advertise_address.to_string(),
                identity: self.identity.to_string(),
                labels: self.labels.clone().into_iter().collect(),
            };

            tasks.push(tokio::spawn({
                let config = config.clone();
                let management_servers = self.management_servers.clone();
                let idle_request_interval = ready.idle_request_interval;
                async move {
                    let result = async {
                        let client = Client::connect(node, management_servers).await?;
                        client
                            .stream(config, healthy, idle_request_interval)
                            .join()
                            .await
                    }
                    .await;

                    if let Err(error) = result {
                        tracing::error!(%error, "discovery client stopped");
                    }
                }
                .instrument(tracing::info_span!("discovery"))
            }));

            let rotator = Rotator::new(
                self.identity.clone(),
                self.management_servers.clone(),
                self.tls.clone(),
            )
            .with_token(self.ca_token.clone())
            .with_ttl(self.certificate_ttl);
            tasks.push(tokio::spawn({
                let shutdown_rx = shutdown_rx.clone();
                async move {
                    if let Err(error) = rotator.run(shutdown_rx).await {
                        tracing::error!(%error, "certificate rotation stopped");
                    }
                }
                .instrument(tracing::info_span!("rotation"))
            }));

            let reporter = Reporter::new(
                self.recorder.clone(),
                config.id(),
                self.service.clone(),
                self.management_servers.clone(),
            )
            .with_interval(self.report_interval);
            reporter_task = Some(tokio::spawn({
                let shutdown_rx = shutdown_rx.clone();
                async move {
                    if let Err(error) = reporter.run(shutdown_rx).await {
                        tracing::error!(%error, "telemetry reporter stopped");
                    }
                }
                .instrument(tracing::info_span!("telemetry"))
            }));
        }

        tracing::info!(address = %self.inbound.local_addr()?, app = %self.app_address, "inbound listener started");
        tasks.push(tokio::spawn(inbound::serve(self.inbound, context.clone())));

        for upstream in self.upstreams {
            tracing::info!(
                service = %upstream.service,
                address = %upstream.listener.local_addr()?,
                "outbound listener started"
            );
            tasks.push(tokio::spawn(outbound::serve(
                upstream.listener,
                upstream.service.into(),
                context.clone(),
            )));
        }

        tracing::info!(service = %self.service, identity = %self.identity, "Trellis sidecar is ready");
        if let Some(initialized) = initialized {
            let _ = initialized.send(());
        }

        crate::signal::wait_for(&mut shutdown_rx).await;
        tracing::info!("shutting down sidecar");

        for task in tasks {
            task.abort();
        }

        if let Some(reporter) = reporter_task {
            let timeout = Duration::from_secs(crate::config::CONNECTION_TIMEOUT);
            if tokio::time::timeout(timeout, reporter).await.is_err() {
                tracing::warn!("final telemetry report timed out");
            }
        }

        Ok(())
    }
}

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

use std::{sync::Arc, time::Duration};

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge};
use time::OffsetDateTime;
use tonic::transport::Endpoint;
use tracing::Instrument;

use super::{
    proto::{certificate_service_client::CertificateServiceClient, CertificateRequest},
    workload::generate_csr,
    SharedTls, TlsContext, WorkloadCertificate,
};
use crate::{
    config::{BACKOFF_INITIAL_DELAY_MILLISECONDS, BACKOFF_MAX_DELAY_SECONDS, CONNECTION_TIMEOUT},
    mesh::Identity,
    metrics::{opts, register},
    signal::ShutdownRx,
};

const SUBSYSTEM: &str = "pki";

fn certificate_expiry() -> &'static IntGauge {
    static CERTIFICATE_EXPIRY: Lazy<IntGauge> = Lazy::new(|| {
        register(
            IntGauge::with_opts(opts(
                "certificate_expiry_timestamp_seconds",
                SUBSYSTEM,
                "Expiry of the workload certificate in use, in seconds since the unix epoch",
            ))
            .unwrap(),
        )
    });

    &CERTIFICATE_EXPIRY
}

fn rotations() -> &'static IntCounter {
    static ROTATIONS: Lazy<IntCounter> = Lazy::new(|| {
        register(
            IntCounter::with_opts(opts(
                "certificate_rotations",
                SUBSYSTEM,
                "Total number of workload certificates installed",
            ))
            .unwrap(),
        )
    });

    &ROTATIONS
}

/// Keeps a sidecar supplied with a valid workload certificate, requesting a
/// new one from the control plane whenever the current one passes its
/// rotation point.
pub struct Rotator {
    identity: Identity,
    endpoints: Vec<Endpoint>,
    token: String,
    ttl: Duration,
    request_timeout: Duration,
    tls: SharedTls,
}

impl Rotator {
    pub fn new(identity: Identity, endpoints: Vec<Endpoint>, tls: SharedTls) -> Self {
        Self {
            identity,
            endpoints,
            token: String::new(),
            ttl: Duration::ZERO,
            request_timeout: Duration::from_secs(CONNECTION_TIMEOUT),
            tls,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// The lifetime to request, `0` leaving it to the authority.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Requests a certificate once, trying each control plane in turn.
    pub async fn request(&self) -> crate::Result<WorkloadCertificate> {
        let (csr, key) = generate_csr(&self.identity)?;
        let mut last_error = eyre::eyre!("no control plane configured");

        for endpoint in &self.endpoints {
            let result = async {
                let endpoint = endpoint
                    .clone()
                    .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT))
                    .timeout(self.request_timeout);
                let mut client = CertificateServiceClient::connect(endpoint).await?;
                let response = client
                    .create_certificate(CertificateRequest {
                        csr: csr.clone(),
                        token: self.token.clone(),
                        ttl_seconds: self.ttl.as_secs(),
                    })
                    .await?
                    .into_inner();

                crate::Result::Ok(WorkloadCertificate::from_response(
                    self.identity.clone(),
                    key.clone(),
                    response,
                )?)
            }
            .instrument(tracing::debug_span!("create_certificate", endpoint = %endpoint.uri()))
            .await;

            match result {
                Ok(certificate) => return Ok(certificate),
                Err(error) => {
                    tracing::debug!(%error, endpoint = %endpoint.uri(), "certificate request failed");
                    last_error = error;
                }
            }
        }

        Err(last_error)
    }

    /// Requests and installs a certificate, either step failing being
    /// retried.
    async fn rotate(&self) -> crate::Result<WorkloadCertificate> {
        let certificate = self.request().await?;
        self.install(&certificate)?;
        Ok(certificate)
    }

    async fn rotate_with_backoff(&self) -> crate::Result<WorkloadCertificate> {
        tryhard::retry_fn(|| self.rotate())
            .retries(u32::MAX)
            .exponential_backoff(Duration::from_millis(BACKOFF_INITIAL_DELAY_MILLISECONDS))
            .max_delay(Duration::from_secs(BACKOFF_MAX_DELAY_SECONDS))
            .on_retry(|attempt, next_delay, error: &eyre::Error| {
                tracing::warn!(%error, attempt, ?next_delay, "retrying certificate rotation");
                std::future::ready(())
            })
            .await
    }

    /// Completes when the installed certificate expires, after removing it
    /// so the sidecar stops presenting it. Never completes while no
    /// certificate is installed.
    async fn clear_on_expiry(&self) {
        let not_after = self.tls.load().as_ref().map(|current| current.not_after());
        let Some(not_after) = not_after else {
            return std::future::pending().await;
        };

        let remaining = Duration::try_from(not_after - OffsetDateTime::now_utc()).unwrap_or(Duration::ZERO);
        tokio::time::sleep(remaining).await;
        tracing::error!(%not_after, "workload certificate expired and no replacement could be issued");
        self.tls.store(None);
        certificate_expiry().set(0);
    }

    /// Builds TLS configuration from `certificate` and makes it current.
    pub fn install(&self, certificate: &WorkloadCertificate) -> Result<(), super::PkiError> {
        let context = TlsContext::new(certificate)?;
        self.tls.store(Some(Arc::new(context)));
        certificate_expiry().set(certificate.not_after().unix_timestamp());
        rotations().inc();
        tracing::info!(
            identity = %certificate.identity(),
            not_after = %certificate.not_after(),
            "installed workload certificate"
        );
        Ok(())
    }

    /// Issues and rotates certificates until shutdown.
    pub async fn run(self, mut shutdown_rx: ShutdownRx) -> crate::Result<()> {
        loop {
            let certificate = tokio::select! {
                result = self.rotate_with_backoff() => result?,
                () = self.clear_on_expiry() => continue,
                _ = shutdown_rx.changed() => return Ok(()),
            };

            let wait = certificate.until_rotation();
            tracing::debug!(?wait, "waiting for rotation");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.changed() => return Ok(()),
            }
        }
    }
}

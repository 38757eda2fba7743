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

use std::time::Duration;

use tonic::transport::Endpoint;

use super::{
    metrics,
    proto::{telemetry_service_client::TelemetryServiceClient, TelemetryReport},
    Recorder,
};
use crate::{config::CONNECTION_TIMEOUT, signal::ShutdownRx};

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(10);

/// Periodically ships the records buffered in a [`Recorder`] to the control
/// plane.
pub struct Reporter {
    recorder: Recorder,
    node_id: String,
    service: String,
    endpoints: Vec<Endpoint>,
    interval: Duration,
}

impl Reporter {
    pub fn new(
        recorder: Recorder,
        node_id: impl Into<String>,
        service: impl Into<String>,
        endpoints: Vec<Endpoint>,
    ) -> Self {
        Self {
            recorder,
            node_id: node_id.into(),
            service: service.into(),
            endpoints,
            interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    /// Sets the flush interval, no shorter than [`MIN_REPORT_INTERVAL`].
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_REPORT_INTERVAL);
        self
    }

    /// Sends everything recorded so far, returning the number of records the
    /// control plane accepted. On failure the records go back into the
    /// recorder for the next flush.
    pub async fn flush(&self) -> crate::Result<u64> {
        let (records, dropped) = self.recorder.take();
        if records.is_empty() && dropped == 0 {
            return Ok(0);
        }

        let report = TelemetryReport {
            node_id: self.node_id.clone(),
            service: self.service.clone(),
            connections: records.iter().cloned().map(From::from).collect(),
            dropped,
        };

        let mut last_error = eyre::eyre!("no control plane configured");
        for endpoint in &self.endpoints {
            match send(endpoint, report.clone()).await {
                Ok(accepted) => {
                    metrics::reports_sent("success").inc();
                    tracing::debug!(records = records.len(), accepted, "sent telemetry report");
                    return Ok(accepted);
                }
                Err(error) => {
                    tracing::debug!(%error, endpoint = %endpoint.uri(), "telemetry report failed");
                    last_error = error;
                }
            }
        }

        metrics::reports_sent("failure").inc();
        self.recorder.restore(records, dropped);
        Err(last_error)
    }

    /// Flushes every interval until shutdown, then once more.
    pub async fn run(self, mut shutdown_rx: ShutdownRx) -> crate::Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = self.flush().await {
                        tracing::warn!(%error, pending = self.recorder.len(), "failed to send telemetry report");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if let Err(error) = self.flush().await {
                        tracing::warn!(%error, "failed to send final telemetry report");
                    }
                    return Ok(());
                }
            }
        }
    }
}

async fn send(endpoint: &Endpoint, report: TelemetryReport) -> crate::Result<u64> {
    let endpoint = endpoint
        .clone()
        .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT))
        .timeout(Duration::from_secs(CONNECTION_TIMEOUT));
    let mut client = TelemetryServiceClient::connect(endpoint).await?;
    Ok(client.report(report).await?.into_inner().accepted)
}

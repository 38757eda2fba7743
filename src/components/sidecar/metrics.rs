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

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

use crate::{
    metrics::{histogram_opts, opts, register, DIRECTION_LABEL, SERVICE_LABEL},
    telemetry::{ConnectionRecord, Direction},
};

const SUBSYSTEM: &str = "sidecar";
const OUTCOME_LABEL: &str = "outcome";

pub(crate) fn connections_total(direction: Direction, service: &str, outcome: &str) -> IntCounter {
    static CONNECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "connections_total",
                    SUBSYSTEM,
                    "Total number of proxied connections, by outcome",
                ),
                &[DIRECTION_LABEL, SERVICE_LABEL, OUTCOME_LABEL],
            )
            .unwrap(),
        )
    });

    CONNECTIONS_TOTAL.with_label_values(&[direction.as_str(), service, outcome])
}

pub(crate) fn errors_total(direction: Direction, reason: &str) -> IntCounter {
    static ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "errors_total",
                    SUBSYSTEM,
                    "Total number of connections that failed, by reason",
                ),
                &[DIRECTION_LABEL, "reason"],
            )
            .unwrap(),
        )
    });

    ERRORS_TOTAL.with_label_values(&[direction.as_str(), reason])
}

pub(crate) fn active_connections(direction: Direction) -> IntGauge {
    static ACTIVE_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
        register(
            IntGaugeVec::new(
                opts(
                    "active_connections",
                    SUBSYSTEM,
                    "Number of connections currently being proxied",
                ),
                &[DIRECTION_LABEL],
            )
            .unwrap(),
        )
    });

    ACTIVE_CONNECTIONS.with_label_values(&[direction.as_str()])
}

pub(crate) fn bytes_total(direction: Direction, flow: &str) -> IntCounter {
    static BYTES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "bytes_total",
                    SUBSYSTEM,
                    "Total number of bytes proxied, `sent` being from client to server",
                ),
                &[DIRECTION_LABEL, "flow"],
            )
            .unwrap(),
        )
    });

    BYTES_TOTAL.with_label_values(&[direction.as_str(), flow])
}

pub(crate) fn connection_duration(direction: Direction) -> Histogram {
    static CONNECTION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
        register(
            HistogramVec::new(
                histogram_opts(
                    "connection_duration_seconds",
                    SUBSYSTEM,
                    "Duration of proxied connections",
                    None,
                ),
                &[DIRECTION_LABEL],
            )
            .unwrap(),
        )
    });

    CONNECTION_DURATION.with_label_values(&[direction.as_str()])
}

pub(crate) fn retries(service: &str) -> IntCounter {
    static RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "upstream_retries",
                    SUBSYSTEM,
                    "Total number of retried upstream connection attempts",
                ),
                &[SERVICE_LABEL],
            )
            .unwrap(),
        )
    });

    RETRIES.with_label_values(&[service])
}

pub(crate) fn ejections() -> &'static IntCounter {
    static EJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
        register(
            IntCounter::with_opts(opts(
                "outlier_ejections",
                SUBSYSTEM,
                "Total number of upstream endpoints ejected by outlier detection",
            ))
            .unwrap(),
        )
    });

    &EJECTIONS
}

/// Adds a finished connection to the local metrics.
pub(crate) fn observe(record: &ConnectionRecord) {
    let service = match record.direction {
        Direction::Inbound => &record.source_service,
        Direction::Outbound => &record.destination_service,
    };
    connections_total(record.direction, service, record.outcome.as_str()).inc();
    bytes_total(record.direction, "sent").inc_by(record.bytes_sent);
    bytes_total(record.direction, "received").inc_by(record.bytes_received);
    connection_duration(record.direction).observe(record.duration.as_secs_f64());
}

/// Tracks a connection in [`active_connections`] while alive.
pub(crate) struct ActiveConnection(Direction);

impl ActiveConnection {
    pub fn new(direction: Direction) -> Self {
        active_connections(direction).inc();
        Self(direction)
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        active_connections(self.0).dec();
    }
}

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

use once_cell::sync::Lazy;
use prometheus::{HistogramVec, IntCounter, IntCounterVec};

use crate::metrics::{histogram_opts, opts, register, DIRECTION_LABEL};

const SUBSYSTEM: &str = "telemetry";
const SOURCE_LABEL: &str = "source";
const DESTINATION_LABEL: &str = "destination";
const OUTCOME_LABEL: &str = "outcome";
const NODE_LABEL: &str = "node";

/// Upper bounds, in milliseconds, of the service graph's latency buckets.
pub const LATENCY_BUCKETS_MS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

pub(crate) fn records_dropped() -> &'static IntCounter {
    static RECORDS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
        register(
            IntCounter::with_opts(opts(
                "records_dropped",
                SUBSYSTEM,
                "Total number of connection records dropped because the report buffer was full",
            ))
            .unwrap(),
        )
    });

    &RECORDS_DROPPED
}

pub(crate) fn reports_sent(result: &str) -> IntCounter {
    static REPORTS_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "reports_sent",
                    SUBSYSTEM,
                    "Total number of telemetry reports sent, by result",
                ),
                &["result"],
            )
            .unwrap(),
        )
    });

    REPORTS_SENT.with_label_values(&[result])
}

pub(crate) fn reports_received(node: &str) -> IntCounter {
    static REPORTS_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "reports_received",
                    SUBSYSTEM,
                    "Total number of telemetry reports received from sidecars",
                ),
                &[NODE_LABEL],
            )
            .unwrap(),
        )
    });

    REPORTS_RECEIVED.with_label_values(&[node])
}

pub(crate) fn records_rejected() -> &'static IntCounter {
    static RECORDS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
        register(
            IntCounter::with_opts(opts(
                "records_rejected",
                SUBSYSTEM,
                "Total number of reported connection records that were rejected",
            ))
            .unwrap(),
        )
    });

    &RECORDS_REJECTED
}

pub(crate) fn edge_connections(
    source: &str,
    destination: &str,
    direction: &str,
    outcome: &str,
) -> IntCounter {
    static EDGE_CONNECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "edge_connections",
                    SUBSYSTEM,
                    "Total number of reported connections between two services",
                ),
                &[SOURCE_LABEL, DESTINATION_LABEL, DIRECTION_LABEL, OUTCOME_LABEL],
            )
            .unwrap(),
        )
    });

    EDGE_CONNECTIONS.with_label_values(&[source, destination, direction, outcome])
}

pub(crate) fn edge_bytes(source: &str, destination: &str, flow: &str) -> IntCounter {
    static EDGE_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "edge_bytes",
                    SUBSYSTEM,
                    "Total number of bytes reported between two services, by flow",
                ),
                &[SOURCE_LABEL, DESTINATION_LABEL, "flow"],
            )
            .unwrap(),
        )
    });

    EDGE_BYTES.with_label_values(&[source, destination, flow])
}

pub(crate) fn edge_latency(source: &str, destination: &str) -> prometheus::Histogram {
    static EDGE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
        register(
            HistogramVec::new(
                histogram_opts(
                    "edge_duration_milliseconds",
                    SUBSYSTEM,
                    "Duration of reported connections between two services",
                    Some(LATENCY_BUCKETS_MS.to_vec()),
                ),
                &[SOURCE_LABEL, DESTINATION_LABEL],
            )
            .unwrap(),
        )
    });

    EDGE_LATENCY.with_label_values(&[source, destination])
}

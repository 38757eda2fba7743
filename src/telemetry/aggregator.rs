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

//! Builds the service graph out of the reports sent by sidecars.

use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use enum_map::EnumMap;
use serde::Serialize;

use super::{
    metrics::{self, LATENCY_BUCKETS_MS},
    proto, Direction, Outcome,
};

/// Service name used for peers that could not be identified, such as
/// plaintext clients from outside the mesh.
pub const UNKNOWN_SERVICE: &str = "unknown";

/// Counts of connection durations in fixed buckets.
#[derive(Clone, Debug, PartialEq)]
pub struct LatencyHistogram {
    /// Non cumulative counts, one per bucket plus one for `+Inf`.
    counts: Vec<u64>,
    sum: Duration,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            counts: vec![0; LATENCY_BUCKETS_MS.len() + 1],
            sum: Duration::ZERO,
        }
    }
}

impl LatencyHistogram {
    pub fn observe(&mut self, duration: Duration) {
        let millis = duration.as_secs_f64() * 1000.0;
        let index = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| millis <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.counts[index] += 1;
        self.sum += duration;
    }

    pub fn count(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn sum(&self) -> Duration {
        self.sum
    }

    /// Cumulative counts keyed by upper bound, the last bound being `+Inf`.
    pub fn buckets(&self) -> Vec<Bucket> {
        let mut total = 0;
        self.counts
            .iter()
            .enumerate()
            .map(|(index, count)| {
                total += count;
                Bucket {
                    le: LATENCY_BUCKETS_MS
                        .get(index)
                        .map_or_else(|| String::from("+Inf"), |bound| bound.to_string()),
                    count: total,
                }
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Bucket {
    /// Upper bound in milliseconds.
    pub le: String,
    pub count: u64,
}

/// What the sidecars on one side of an edge reported about it.
#[derive(Clone, Debug, Default)]
struct DirectionStats {
    connections: u64,
    outcomes: EnumMap<Outcome, u64>,
    bytes_sent: u64,
    bytes_received: u64,
    latency: LatencyHistogram,
}

impl DirectionStats {
    fn observe(&mut self, outcome: Outcome, stats: &proto::ConnectionStats) {
        self.connections += 1;
        self.outcomes[outcome] += 1;
        self.bytes_sent += stats.bytes_sent;
        self.bytes_received += stats.bytes_received;
        self.latency.observe(Duration::from_micros(stats.duration_us));
    }

    fn snapshot(&self) -> DirectionSnapshot {
        DirectionSnapshot {
            connections: self.connections,
            outcomes: self
                .outcomes
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(outcome, count)| (outcome.as_str(), *count))
                .collect(),
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            latency_ms_sum: self.latency.sum().as_secs_f64() * 1000.0,
            latency_buckets: self.latency.buckets(),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct EdgeStats {
    directions: EnumMap<Direction, DirectionStats>,
    last_seen: Option<SystemTime>,
}

/// The traffic between two services as reported by one side of it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DirectionSnapshot {
    pub connections: u64,
    pub outcomes: BTreeMap<&'static str, u64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub latency_ms_sum: f64,
    pub latency_buckets: Vec<Bucket>,
}

/// An edge of the service graph. Both sidecars of a meshed connection report
/// it, the client side as `outbound` and the server side as `inbound`, so the
/// two views are kept apart rather than summed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EdgeSnapshot {
    pub source: String,
    pub destination: String,
    /// Seconds since the unix epoch.
    pub last_seen: u64,
    pub outbound: DirectionSnapshot,
    pub inbound: DirectionSnapshot,
}

impl EdgeSnapshot {
    /// Connections seen from either side.
    pub fn connections(&self) -> u64 {
        self.outbound.connections.max(self.inbound.connections)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub service: String,
    /// Seconds since the unix epoch.
    pub last_report: u64,
    pub reports: u64,
    pub dropped: u64,
}

#[derive(Clone, Debug)]
struct NodeStats {
    service: String,
    last_report: SystemTime,
    reports: u64,
    dropped: u64,
}

/// The service to service traffic graph.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceGraph {
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
}

/// Aggregates reports from every sidecar into a [`ServiceGraph`].
#[derive(Debug, Default)]
pub struct Aggregator {
    edges: DashMap<(String, String), EdgeStats>,
    nodes: DashMap<String, NodeStats>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a report into the graph, returning how many of its records were
    /// accepted. Records without a destination service are skipped.
    pub fn ingest(&self, report: proto::TelemetryReport) -> u64 {
        let now = SystemTime::now();
        metrics::reports_received(&report.node_id).inc();

        {
            let mut node = self
                .nodes
                .entry(report.node_id.clone())
                .or_insert_with(|| NodeStats {
                    service: report.service.clone(),
                    last_report: now,
                    reports: 0,
                    dropped: 0,
                });
            node.service = report.service.clone();
            node.last_report = now;
            node.reports += 1;
            node.dropped += report.dropped;
        }

        let mut accepted = 0;
        for stats in &report.connections {
            if stats.destination_service.is_empty() {
                tracing::debug!(node = %report.node_id, "rejecting record without destination service");
                metrics::records_rejected().inc();
                continue;
            }

            let direction = proto::connection_stats::Direction::try_from(stats.direction)
                .map(Direction::from)
                .unwrap_or(Direction::Outbound);
            let outcome = proto::connection_stats::Outcome::try_from(stats.outcome)
                .map(Outcome::from)
                .unwrap_or(Outcome::ConnectFailure);
            let source = if stats.source_service.is_empty() {
                UNKNOWN_SERVICE
            } else {
                stats.source_service.as_str()
            };

            let key = (source.to_owned(), stats.destination_service.clone());
            let mut edge = self.edges.entry(key).or_default();
            edge.directions[direction].observe(outcome, stats);
            edge.last_seen = Some(now);
            drop(edge);

            let destination = &stats.destination_service;
            metrics::edge_connections(source, destination, direction.as_str(), outcome.as_str())
                .inc();
            if direction == Direction::Outbound {
                metrics::edge_bytes(source, destination, "sent").inc_by(stats.bytes_sent);
                metrics::edge_bytes(source, destination, "received").inc_by(stats.bytes_received);
                metrics::edge_latency(source, destination)
                    .observe(Duration::from_micros(stats.duration_us).as_secs_f64() * 1000.0);
            }

            accepted += 1;
        }

        tracing::trace!(node = %report.node_id, accepted, "ingested telemetry report");
        accepted
    }

    pub fn edge(&self, source: &str, destination: &str) -> Option<EdgeSnapshot> {
        self.edges
            .get(&(source.to_owned(), destination.to_owned()))
            .map(|entry| snapshot_edge(entry.key(), entry.value()))
    }

    /// A consistent ordering of every node and edge seen so far.
    pub fn graph(&self) -> ServiceGraph {
        let mut nodes: Vec<_> = self
            .nodes
            .iter()
            .map(|entry| NodeSnapshot {
                id: entry.key().clone(),
                service: entry.service.clone(),
                last_report: unix_seconds(entry.last_report),
                reports: entry.reports,
                dropped: entry.dropped,
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut edges: Vec<_> = self
            .edges
            .iter()
            .map(|entry| snapshot_edge(entry.key(), entry.value()))
            .collect();
        edges.sort_by(|a, b| (&a.source, &a.destination).cmp(&(&b.source, &b.destination)));

        ServiceGraph { nodes, edges }
    }
}

fn snapshot_edge((source, destination): &(String, String), stats: &EdgeStats) -> EdgeSnapshot {
    EdgeSnapshot {
        source: source.clone(),
        destination: destination.clone(),
        last_seen: stats.last_seen.map_or(0, unix_seconds),
        outbound: stats.directions[Direction::Outbound].snapshot(),
        inbound: stats.directions[Direction::Inbound].snapshot(),
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

#[tonic::async_trait]
impl proto::telemetry_service_server::TelemetryService for Aggregator {
    #[tracing::instrument(skip_all)]
    async fn report(
        &self,
        request: tonic::Request<proto::TelemetryReport>,
    ) -> Result<tonic::Response<proto::ReportResponse>, tonic::Status> {
        let report = request.into_inner();
        if report.node_id.is_empty() {
            return Err(tonic::Status::invalid_argument("Node identifier required"));
        }

        let accepted = self.ingest(report);
        Ok(tonic::Response::new(proto::ReportResponse { accepted }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ConnectionRecord;
    use pretty_assertions::assert_eq;

    fn report(node_id: &str, records: Vec<ConnectionRecord>) -> proto::TelemetryReport {
        proto::TelemetryReport {
            node_id: node_id.into(),
            service: "productpage".into(),
            connections: records.into_iter().map(From::from).collect(),
            dropped: 0,
        }
    }

    fn outbound(outcome: Outcome, duration: Duration) -> ConnectionRecord {
        ConnectionRecord {
            outcome,
            duration,
            bytes_sent: 10,
            bytes_received: 20,
            attempts: 1,
            ..ConnectionRecord::new(Direction::Outbound, "productpage", "reviews")
        }
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let mut histogram = LatencyHistogram::default();
        histogram.observe(Duration::from_micros(500));
        histogram.observe(Duration::from_millis(7));
        histogram.observe(Duration::from_secs(60));

        let buckets = histogram.buckets();
        assert_eq!(LATENCY_BUCKETS_MS.len() + 1, buckets.len());
        assert_eq!(Bucket { le: "1".into(), count: 1 }, buckets[0]);
        assert_eq!(Bucket { le: "10".into(), count: 2 }, buckets[2]);
        assert_eq!(Bucket { le: "+Inf".into(), count: 3 }, buckets[buckets.len() - 1]);
        assert_eq!(3, histogram.count());
    }

    #[test]
    fn aggregates_edges_per_direction() {
        let aggregator = Aggregator::new();
        let accepted = aggregator.ingest(report(
            "productpage-1",
            vec![
                outbound(Outcome::Success, Duration::from_millis(3)),
                outbound(Outcome::ConnectFailure, Duration::from_millis(30)),
                ConnectionRecord::new(Direction::Outbound, "productpage", ""),
            ],
        ));
        assert_eq!(2, accepted);

        let inbound = ConnectionRecord::new(Direction::Inbound, "productpage", "reviews");
        let mut reviews = report("reviews-1", vec![inbound]);
        reviews.service = "reviews".into();
        reviews.dropped = 4;
        assert_eq!(1, aggregator.ingest(reviews));

        let edge = aggregator.edge("productpage", "reviews").unwrap();
        assert_eq!(2, edge.outbound.connections);
        assert_eq!(1, edge.inbound.connections);
        assert_eq!(2, edge.connections());
        assert_eq!(
            BTreeMap::from([("connect_failure", 1), ("success", 1)]),
            edge.outbound.outcomes
        );
        assert_eq!(20, edge.outbound.bytes_sent);
        assert_eq!(40, edge.outbound.bytes_received);
        assert!(edge.last_seen > 0);

        let graph = aggregator.graph();
        assert_eq!(1, graph.edges.len());
        assert_eq!(
            vec!["productpage-1", "reviews-1"],
            graph.nodes.iter().map(|n| n.id.as_str()).collect::<Vec<_>>()
        );
        assert_eq!(4, graph.nodes[1].dropped);
    }

    #[test]
    fn unidentified_sources_are_grouped() {
        let aggregator = Aggregator::new();
        let record = ConnectionRecord::new(Direction::Inbound, "", "reviews");
        aggregator.ingest(report("reviews-1", vec![record]));

        assert!(aggregator.edge(UNKNOWN_SERVICE, "reviews").is_some());
    }

    #[tokio::test]
    async fn report_requires_node() {
        use proto::telemetry_service_server::TelemetryService;

        let aggregator = Aggregator::new();
        let status = aggregator
            .report(tonic::Request::new(report("", Vec::new())))
            .await
            .unwrap_err();
        assert_eq!(tonic::Code::InvalidArgument, status.code());

        let response = aggregator
            .report(tonic::Request::new(report(
                "productpage-1",
                vec![outbound(Outcome::Success, Duration::ZERO)],
            )))
            .await
            .unwrap();
        assert_eq!(1, response.into_inner().accepted);
    }
}

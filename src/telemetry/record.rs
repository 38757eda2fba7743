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

use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;

use super::{metrics, proto};
use crate::mesh::Identity;

/// Records kept by a sidecar between two reports.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Which listener a connection arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, enum_map::Enum)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl From<Direction> for proto::connection_stats::Direction {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Inbound => Self::Inbound,
            Direction::Outbound => Self::Outbound,
        }
    }
}

impl From<proto::connection_stats::Direction> for Direction {
    fn from(direction: proto::connection_stats::Direction) -> Self {
        match direction {
            proto::connection_stats::Direction::Inbound => Self::Inbound,
            proto::connection_stats::Direction::Outbound => Self::Outbound,
        }
    }
}

/// How a proxied connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, enum_map::Enum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    ConnectFailure,
    Denied,
    NoUpstream,
    TlsFailure,
}

impl Outcome {
    /// The metric label value of the outcome.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ConnectFailure => "connect_failure",
            Self::Denied => "denied",
            Self::NoUpstream => "no_upstream",
            Self::TlsFailure => "tls_failure",
        }
    }
}

impl From<Outcome> for proto::connection_stats::Outcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::Success,
            Outcome::ConnectFailure => Self::ConnectFailure,
            Outcome::Denied => Self::Denied,
            Outcome::NoUpstream => Self::NoUpstream,
            Outcome::TlsFailure => Self::TlsFailure,
        }
    }
}

impl From<proto::connection_stats::Outcome> for Outcome {
    fn from(outcome: proto::connection_stats::Outcome) -> Self {
        use proto::connection_stats::Outcome as P;
        match outcome {
            P::Success => Self::Success,
            P::ConnectFailure => Self::ConnectFailure,
            P::Denied => Self::Denied,
            P::NoUpstream => Self::NoUpstream,
            P::TlsFailure => Self::TlsFailure,
        }
    }
}

/// Everything a sidecar learned about one proxied connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub direction: Direction,
    pub source_service: String,
    pub source_identity: Option<Identity>,
    pub destination_service: String,
    pub destination_identity: Option<Identity>,
    /// The endpoint or local application the connection was forwarded to.
    pub upstream: Option<SocketAddr>,
    pub outcome: Outcome,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duration: Duration,
    pub attempts: u32,
}

impl ConnectionRecord {
    pub fn new(
        direction: Direction,
        source_service: impl Into<String>,
        destination_service: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            source_service: source_service.into(),
            source_identity: None,
            destination_service: destination_service.into(),
            destination_identity: None,
            upstream: None,
            outcome: Outcome::Success,
            bytes_sent: 0,
            bytes_received: 0,
            duration: Duration::ZERO,
            attempts: 0,
        }
    }
}

impl From<ConnectionRecord> for proto::ConnectionStats {
    fn from(record: ConnectionRecord) -> Self {
        Self {
            direction: proto::connection_stats::Direction::from(record.direction) as i32,
            source_service: record.source_service,
            source_identity: record
                .source_identity
                .map(|identity| identity.to_string())
                .unwrap_or_default(),
            destination_service: record.destination_service,
            destination_identity: record
                .destination_identity
                .map(|identity| identity.to_string())
                .unwrap_or_default(),
            upstream_address: record
                .upstream
                .map(|address| address.to_string())
                .unwrap_or_default(),
            outcome: proto::connection_stats::Outcome::from(record.outcome) as i32,
            bytes_sent: record.bytes_sent,
            bytes_received: record.bytes_received,
            duration_us: u64::try_from(record.duration.as_micros()).unwrap_or(u64::MAX),
            attempts: record.attempts,
        }
    }
}

#[derive(Debug)]
struct Buffer {
    records: VecDeque<ConnectionRecord>,
    capacity: usize,
    dropped: u64,
}

impl Buffer {
    fn push(&mut self, record: ConnectionRecord) {
        self.records.push_back(record);
        self.enforce_capacity();
    }

    /// Drops the oldest records until the buffer is within capacity.
    fn enforce_capacity(&mut self) {
        while self.records.len() > self.capacity {
            self.records.pop_front();
            self.dropped += 1;
            metrics::records_dropped().inc();
        }
    }
}

/// A bounded buffer of connection records waiting to be reported. When full,
/// the oldest record is dropped to make room.
#[derive(Clone, Debug)]
pub struct Recorder {
    inner: Arc<Mutex<Buffer>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Recorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Buffer {
                records: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                capacity: capacity.max(1),
                dropped: 0,
            })),
        }
    }

    pub fn record(&self, record: ConnectionRecord) {
        self.inner.lock().push(record);
    }

    /// Takes every buffered record along with the number of records dropped
    /// since the last call.
    pub fn take(&self) -> (Vec<ConnectionRecord>, u64) {
        let mut buffer = self.inner.lock();
        let records = buffer.records.drain(..).collect();
        (records, std::mem::take(&mut buffer.dropped))
    }

    /// Puts back records that could not be reported, ahead of anything
    /// recorded since they were taken. Capacity still applies, so the
    /// oldest records are the first to go.
    pub fn restore(&self, records: Vec<ConnectionRecord>, dropped: u64) {
        let mut buffer = self.inner.lock();
        for record in records.into_iter().rev() {
            buffer.records.push_front(record);
        }
        buffer.dropped += dropped;
        buffer.enforce_capacity();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records dropped since the last [`Recorder::take`].
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(attempts: u32) -> ConnectionRecord {
        ConnectionRecord {
            attempts,
            ..ConnectionRecord::new(Direction::Outbound, "productpage", "reviews")
        }
    }

    #[test]
    fn overflow_drops_oldest() {
        let recorder = Recorder::new(3);
        for attempts in 1..=5 {
            recorder.record(record(attempts));
        }

        assert_eq!(3, recorder.len());
        assert_eq!(2, recorder.dropped());

        let (records, dropped) = recorder.take();
        assert_eq!(
            vec![3, 4, 5],
            records.iter().map(|r| r.attempts).collect::<Vec<_>>()
        );
        assert_eq!(2, dropped);
        assert!(recorder.is_empty());
        assert_eq!(0, recorder.dropped());
    }

    #[test]
    fn restore_keeps_order_and_bound() {
        let recorder = Recorder::new(4);
        recorder.record(record(1));
        recorder.record(record(2));
        let (taken, dropped) = recorder.take();

        recorder.record(record(3));
        recorder.record(record(4));
        recorder.record(record(5));
        recorder.restore(taken, dropped);

        let (records, dropped) = recorder.take();
        assert_eq!(
            vec![2, 3, 4, 5],
            records.iter().map(|r| r.attempts).collect::<Vec<_>>()
        );
        assert_eq!(1, dropped);
    }

    #[test]
    fn converts_to_wire_format() {
        let record = ConnectionRecord {
            source_identity: "productpage.default.serviceaccount.identity.cluster.local"
                .parse()
                .ok(),
            upstream: Some((std::net::Ipv4Addr::LOCALHOST, 9080).into()),
            outcome: Outcome::TlsFailure,
            duration: Duration::from_millis(3),
            ..record(2)
        };

        let stats = proto::ConnectionStats::from(record);
        assert_eq!(proto::connection_stats::Direction::Outbound as i32, stats.direction);
        assert_eq!(
            "productpage.default.serviceaccount.identity.cluster.local",
            stats.source_identity
        );
        assert_eq!("", stats.destination_identity);
        assert_eq!("127.0.0.1:9080", stats.upstream_address);
        assert_eq!(proto::connection_stats::Outcome::TlsFailure as i32, stats.outcome);
        assert_eq!(3000, stats.duration_us);
        assert_eq!(2, stats.attempts);
    }
}

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

//! The per upstream listeners the application connects to.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    net::{TcpListener, TcpStream},
    time::Instant,
};
use tokio_rustls::client::TlsStream;
use tracing::Instrument;

use super::{metrics, Context, ProxyError};
use crate::{
    mesh::{Endpoint, Route},
    telemetry::{ConnectionRecord, Direction},
};

pub(super) async fn serve(listener: TcpListener, service: Arc<str>, context: Arc<Context>) {
    loop {
        match listener.accept().await {
            Ok((stream, source)) => {
                let span = tracing::debug_span!("outbound", service = %service, %source);
                tokio::spawn(handle(context.clone(), service.clone(), stream, source).instrument(span));
            }
            Err(error) => {
                tracing::warn!(%error, %service, "failed to accept outbound connection");
            }
        }
    }
}

async fn handle(context: Arc<Context>, service: Arc<str>, stream: TcpStream, source: SocketAddr) {
    let _active = metrics::ActiveConnection::new(Direction::Outbound);
    let start = Instant::now();

    let mut record = ConnectionRecord::new(Direction::Outbound, context.service.clone(), &*service);
    record.source_identity = Some(context.identity.clone());

    if let Err(error) = proxy(&context, &service, stream, source, &mut record).await {
        tracing::debug!(%error, "outbound connection failed");
        metrics::errors_total(Direction::Outbound, error.discriminant()).inc();
        record.outcome = error.outcome();
    }

    record.duration = start.elapsed();
    context.finish(record);
}

async fn proxy(
    context: &Context,
    service: &str,
    mut downstream: TcpStream,
    source: SocketAddr,
    record: &mut ConnectionRecord,
) -> Result<(), ProxyError> {
    let route = context.config.routes.load().get(service);
    let endpoints = context.router.resolve(&context.config, &route);
    if endpoints.is_empty() {
        return Err(ProxyError::NoUpstream(service.into()));
    }

    let attempts = route.retry.attempts.max(1);
    let mut tried = Vec::new();
    let mut last_error = None;

    for attempt in 1..=attempts {
        let Some(endpoint) =
            context
                .router
                .pick(&route, &endpoints, &source, &tried, &context.outliers)
        else {
            break;
        };

        if attempt > 1 {
            metrics::retries(service).inc();
        }
        tried.push(endpoint.address);
        record.attempts = attempt;
        record.upstream = Some(endpoint.address);
        record.destination_identity = endpoint.identity.clone();

        match connect(context, &route, &endpoint).await {
            Ok(upstream) => {
                context.outliers.record_success(endpoint.address);
                match upstream.splice(&mut downstream).await {
                    Ok((sent, received)) => {
                        record.bytes_sent = sent;
                        record.bytes_received = received;
                    }
                    Err(error) => tracing::debug!(%error, "outbound connection closed with error"),
                }
                return Ok(());
            }
            Err(error) => {
                if error.is_endpoint_failure() {
                    context.outliers.record_failure(endpoint.address);
                }
                tracing::debug!(%error, attempt, endpoint = %endpoint.address, "upstream attempt failed");
                last_error = Some(error);

                if attempt < attempts {
                    tokio::time::sleep(route.retry.backoff(attempt)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ProxyError::NoUpstream(service.into())))
}

/// A connection to an upstream endpoint, encrypted when the endpoint is part
/// of the mesh.
enum Upstream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Upstream {
    /// Copies data both ways until either side closes, returning the bytes
    /// sent upstream and received from it.
    async fn splice(self, downstream: &mut TcpStream) -> io::Result<(u64, u64)> {
        match self {
            Self::Plain(mut upstream) => tokio::io::copy_bidirectional(downstream, &mut upstream).await,
            Self::Tls(mut upstream) => tokio::io::copy_bidirectional(downstream, &mut *upstream).await,
        }
    }
}

async fn connect(context: &Context, route: &Route, endpoint: &Endpoint) -> Result<Upstream, ProxyError> {
    let address = endpoint.address;
    let attempt = async {
        let stream = tokio::time::timeout(route.connect_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| ProxyError::Timeout(address))?
            .map_err(|source| ProxyError::Connect { address, source })?;
        stream.set_nodelay(true)?;

        match &endpoint.identity {
            None => Ok(Upstream::Plain(stream)),
            Some(identity) => {
                let tls = context.tls.load_full().ok_or(ProxyError::NoCertificate)?;
                let stream = tls
                    .connect(identity, stream)
                    .await
                    .map_err(|source| ProxyError::Tls { address, source })?;
                Ok(Upstream::Tls(Box::new(stream)))
            }
        }
    };

    tokio::time::timeout(route.retry.per_try_timeout(), attempt)
        .await
        .map_err(|_| ProxyError::Timeout(address))?
}

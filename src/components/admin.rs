/*
 * Copyright 2021 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *       http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

mod health;

use std::{convert::Infallible, sync::Arc, time::Duration};

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server as HyperServer, StatusCode,
};

use self::health::Health;
use super::{control_plane, sidecar};
use crate::{config::Config, signal::ShutdownTx};

pub const PORT: u16 = 8000;

pub(crate) const IDLE_REQUEST_INTERVAL: Duration = Duration::from_secs(30);

/// The mode the process runs in, carrying what the admin endpoints need to
/// know about it.
#[derive(Clone, Debug)]
pub enum Admin {
    Sidecar(sidecar::Ready),
    ControlPlane(control_plane::Ready),
}

impl Admin {
    #[track_caller]
    pub fn unwrap_sidecar(&self) -> &sidecar::Ready {
        match self {
            Self::Sidecar(ready) => ready,
            _ => panic!("attempted to unwrap sidecar config when not in sidecar mode"),
        }
    }

    #[track_caller]
    pub fn unwrap_control_plane(&self) -> &control_plane::Ready {
        match self {
            Self::ControlPlane(ready) => ready,
            _ => panic!("attempted to unwrap control plane config when not in control plane mode"),
        }
    }

    pub fn idle_request_interval(&self) -> Duration {
        match self {
            Self::Sidecar(ready) => ready.idle_request_interval,
            Self::ControlPlane(ready) => ready.idle_request_interval,
        }
    }

    /// Serves the admin endpoints on their own thread, so a busy proxy
    /// runtime can't starve health checks.
    pub fn server(
        &self,
        config: Arc<Config>,
        address: Option<std::net::SocketAddr>,
        shutdown_tx: Option<ShutdownTx>,
    ) -> std::io::Result<std::thread::JoinHandle<Result<(), hyper::Error>>> {
        let address = address.unwrap_or_else(|| (std::net::Ipv6Addr::UNSPECIFIED, PORT).into());
        let health = Health::new(shutdown_tx);
        tracing::info!(address = %address, "Starting admin endpoint");

        let mode = self.clone();
        std::thread::Builder::new()
            .name("admin-http".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .enable_time()
                    .thread_name("admin-http-worker")
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        tracing::error!(%error, "couldn't create admin runtime");
                        return Ok(());
                    }
                };

                runtime.block_on(async move {
                    let make_svc = make_service_fn(move |_conn| {
                        let config = config.clone();
                        let health = health.clone();
                        let mode = mode.clone();
                        async move {
                            Ok::<_, Infallible>(service_fn(move |req| {
                                let config = config.clone();
                                let health = health.clone();
                                let mode = mode.clone();
                                async move {
                                    Ok::<_, Infallible>(mode.handle_request(req, &config, &health))
                                }
                            }))
                        }
                    });

                    HyperServer::try_bind(&address)?.serve(make_svc).await
                })
            })
    }

    fn is_ready(&self) -> bool {
        match self {
            Self::Sidecar(ready) => ready.is_ready(),
            Self::ControlPlane(ready) => ready.is_ready(),
        }
    }

    fn handle_request(&self, request: Request<Body>, config: &Config, health: &Health) -> Response<Body> {
        tracing::trace!(method = %request.method(), path = %request.uri().path(), "handling admin request");

        match (request.method(), request.uri().path()) {
            (&Method::GET, "/metrics") => collect_metrics(),
            (&Method::GET, "/live" | "/livez") => health.check_liveness(),
            (&Method::GET, "/ready" | "/readyz") => check_readiness(|| self.is_ready()),
            (&Method::GET, "/config") => json_response(config),
            (&Method::GET, "/telemetry") => match self {
                Self::ControlPlane(ready) => json_response(&ready.aggregator.graph()),
                Self::Sidecar(_) => not_found(),
            },
            (_, _) => not_found(),
        }
    }
}

fn json_response<T: serde::Serialize + ?Sized>(value: &T) -> Response<Body> {
    let result = serde_json::to_string(value).map_err(eyre::Error::from).and_then(|body| {
        Response::builder()
            .status(StatusCode::OK)
            .header(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            )
            .body(Body::from(body))
            .map_err(From::from)
    });

    match result {
        Ok(response) => response,
        Err(error) => {
            tracing::warn!(%error, "failed to serialize admin response");
            let mut response = Response::new(Body::from(format!("failed to create dump: {error}")));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn not_found() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

fn check_readiness(check: impl Fn() -> bool) -> Response<Body> {
    if (check)() {
        return Response::new("ok".into());
    }

    let mut response = Response::new(Body::from("NOT READY"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

fn collect_metrics() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    let mut buffer = vec![];
    let encoder = prometheus::TextEncoder::new();
    let body =
        prometheus::Encoder::encode(&encoder, &crate::metrics::registry().gather(), &mut buffer)
            .map_err(|error| tracing::warn!(%error, "Failed to encode metrics"))
            .and_then(|_| {
                String::from_utf8(buffer)
                    .map(Body::from)
                    .map_err(|error| tracing::warn!(%error, "Failed to convert metrics to utf8"))
            });

    match body {
        Ok(body) => {
            *response.body_mut() = body;
        }
        Err(_) => {
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    response
}

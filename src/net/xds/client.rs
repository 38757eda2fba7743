/*
 * Copyright 2020 Google LLC All Rights Reserved.
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
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint, Error as TonicError};
use tracing::Instrument;
use tryhard::{
    backoff_strategies::{BackoffStrategy, ExponentialBackoff},
    RetryFutureConfig, RetryPolicy,
};

use super::{
    metrics,
    proto::{
        mesh_discovery_service_client::MeshDiscoveryServiceClient, DiscoveryRequest,
        DiscoveryResponse, ErrorDetail, Node,
    },
    ResourceType,
};
use crate::{config::Config, Result};

type DiscoveryClient = MeshDiscoveryServiceClient<Channel>;

/// gRPC status code sent back with a rejected response.
const INVALID_ARGUMENT: i32 = 3;
/// Shortest idle request interval a stream will use.
pub const MIN_IDLE_REQUEST_INTERVAL: Duration = Duration::from_millis(100);

/// A connection to one of the mesh's control planes.
#[derive(Clone)]
pub struct Client {
    client: DiscoveryClient,
    node: Arc<Node>,
    management_servers: Vec<Endpoint>,
}

impl Client {
    #[tracing::instrument(skip_all, level = "trace", fields(servers = ?management_servers))]
    pub async fn connect(node: Node, management_servers: Vec<Endpoint>) -> Result<Self> {
        let client = Self::connect_with_backoff(&management_servers).await?;
        Ok(Self {
            client,
            node: Arc::new(node),
            management_servers,
        })
    }

    async fn connect_with_backoff(management_servers: &[Endpoint]) -> Result<DiscoveryClient> {
        use crate::config::{
            BACKOFF_INITIAL_DELAY_MILLISECONDS, BACKOFF_MAX_DELAY_SECONDS,
            BACKOFF_MAX_JITTER_MILLISECONDS, CONNECTION_TIMEOUT,
        };

        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(BACKOFF_INITIAL_DELAY_MILLISECONDS));
        let max_delay = Duration::from_secs(BACKOFF_MAX_DELAY_SECONDS);

        let retry_config = RetryFutureConfig::new(u32::MAX).custom_backoff(|attempt, error: &_| {
            tracing::info!(attempt, "retrying to connect");
            // reset after success
            if attempt <= 1 {
                backoff = ExponentialBackoff::new(Duration::from_millis(
                    BACKOFF_INITIAL_DELAY_MILLISECONDS,
                ));
            }

            let mut delay = backoff.delay(attempt, &error).min(max_delay);
            delay += Duration::from_millis(
                rand::thread_rng().gen_range(0..BACKOFF_MAX_JITTER_MILLISECONDS),
            );

            match error {
                RpcSessionError::InvalidEndpoint(ref error) => {
                    tracing::error!(?error, "error creating endpoint");
                    // An invalid URI will not fix itself.
                    RetryPolicy::Break
                }
                RpcSessionError::InitialConnect(ref error) => {
                    tracing::warn!(?error, "unable to connect to the control plane");
                    RetryPolicy::Delay(delay)
                }
                RpcSessionError::Receive(ref status) => {
                    tracing::warn!(status = ?status, "failed to receive response from control plane");
                    RetryPolicy::Delay(delay)
                }
            }
        });

        let mut addresses = management_servers.iter().cycle();
        let connect_to_server = tryhard::retry_fn(|| {
            let address = addresses.next();
            async move {
                match address {
                    None => Err(RpcSessionError::Receive(tonic::Status::internal(
                        "Failed initial connection",
                    ))),
                    Some(endpoint) => {
                        tracing::info!("attempting to connect to `{}`", endpoint.uri());
                        let endpoint = endpoint
                            .clone()
                            .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT));

                        if endpoint.uri().scheme().is_none() {
                            return Err(RpcSessionError::InvalidEndpoint(
                                "No scheme provided".into(),
                            ));
                        } else if endpoint.uri().host().is_none() {
                            return Err(RpcSessionError::InvalidEndpoint(
                                "No host provided".into(),
                            ));
                        }

                        DiscoveryClient::connect(endpoint)
                            .instrument(tracing::debug_span!("MeshDiscoveryServiceClient::connect"))
                            .await
                            .map_err(RpcSessionError::InitialConnect)
                    }
                }
            }
        })
        .with_config(retry_config);

        let client = connect_to_server
            .instrument(tracing::trace_span!("client_connect"))
            .await?;
        tracing::info!("connected to control plane");
        Ok(client)
    }

    /// Starts streaming resources into `config`, reconnecting whenever the
    /// stream breaks. `healthy` reflects whether the stream is currently
    /// receiving responses.
    pub fn stream(
        &self,
        config: Arc<Config>,
        healthy: Arc<AtomicBool>,
        idle_request_interval: Duration,
    ) -> DiscoveryStream {
        let Client {
            client,
            node,
            management_servers,
        } = self.clone();
        let idle_request_interval = idle_request_interval.max(MIN_IDLE_REQUEST_INTERVAL);

        DiscoveryStream::spawn(async move {
            let mut client = client;
            tracing::trace!("starting discovery client stream task");
            loop {
                let (requests, rx) = mpsc::unbounded_channel();
                subscribe_all(&node, &requests)?;

                tracing::trace!("connecting to grpc stream");
                let result = client
                    .stream_resources(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
                    .in_current_span()
                    .await
                    .map(tonic::Response::into_inner);

                match result {
                    Ok(stream) => {
                        let acks = handle_discovery_responses(stream, config.clone());
                        run_session(&node, &requests, acks, &healthy, idle_request_interval).await;
                    }
                    Err(error) => tracing::warn!(%error, "stream broken"),
                }

                healthy.store(false, Ordering::SeqCst);
                tracing::info!("Lost connection to control plane, retrying");
                client = Client::connect_with_backoff(&management_servers).await?;
            }
        })
    }
}

/// Sends the ACK or NACK for every response until the session ends. After
/// one silent `idle_request_interval` every type is requested again; after a
/// second one the session is given up.
async fn run_session(
    node: &Node,
    requests: &mpsc::UnboundedSender<DiscoveryRequest>,
    mut acks: impl futures::Stream<Item = Result<DiscoveryRequest>> + Unpin,
    healthy: &AtomicBool,
    idle_request_interval: Duration,
) {
    let mut idle_intervals = 0;

    loop {
        match tokio::time::timeout(idle_request_interval, acks.next()).await {
            Ok(Some(Ok(ack))) => {
                idle_intervals = 0;
                healthy.store(true, Ordering::SeqCst);
                tracing::trace!("sending ack");
                if requests.send(ack).is_err() {
                    break;
                }
            }
            Ok(Some(Err(error))) => {
                tracing::warn!(%error, "discovery stream error");
                break;
            }
            Ok(None) => {
                tracing::warn!("discovery stream terminated");
                break;
            }
            Err(_) if idle_intervals == 0 => {
                idle_intervals += 1;
                tracing::info!("exceeded idle request interval sending new requests");
                if let Err(error) = subscribe_all(node, requests) {
                    tracing::warn!(%error, "failed to resubscribe");
                    break;
                }
            }
            Err(_) => {
                tracing::warn!("control plane did not answer resubscription");
                break;
            }
        }
    }
}

fn subscribe_all(node: &Node, requests: &mpsc::UnboundedSender<DiscoveryRequest>) -> Result<()> {
    for resource_type in ResourceType::VARIANTS {
        tracing::trace!(r#type = %resource_type, "sending discovery request");
        requests.send(DiscoveryRequest {
            node: Some(node.clone()),
            type_url: resource_type.type_url().into(),
            ..DiscoveryRequest::default()
        })?;
    }

    Ok(())
}

/// An active discovery stream, stopped when dropped.
pub struct DiscoveryStream {
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl DiscoveryStream {
    fn spawn(task: impl std::future::Future<Output = Result<()>> + Send + 'static) -> Self {
        tracing::trace!("spawning stream background task");
        Self {
            handle: tokio::spawn(task.instrument(tracing::trace_span!("handle_discovery_response"))),
        }
    }

    /// Waits for the stream task, which only returns on unrecoverable errors.
    pub async fn join(mut self) -> Result<()> {
        (&mut self.handle).await?
    }
}

impl Drop for DiscoveryStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, thiserror::Error)]
enum RpcSessionError {
    #[error("Invalid endpoint. \n {0}")]
    InvalidEndpoint(String),

    #[error("Failed to establish initial connection.\n {0:?}")]
    InitialConnect(TonicError),

    #[error("Error occurred while receiving data. Status: {0}")]
    Receive(tonic::Status),
}

/// Applies every response of `stream` to `config`, yielding the ACK or NACK
/// to send back for each one.
pub fn handle_discovery_responses(
    stream: impl futures::Stream<Item = tonic::Result<DiscoveryResponse>> + 'static + Send,
    config: Arc<Config>,
) -> std::pin::Pin<Box<dyn futures::Stream<Item = Result<DiscoveryRequest>> + Send>> {
    Box::pin(async_stream::try_stream! {
        let mut stream_metrics = None;
        tracing::debug!("awaiting response");
        for await response in stream
        {
            let response = match response {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(%error, "Error from control plane");
                    break;
                }
            };

            let control_plane_identifier = response.control_plane.as_ref().map(|cp| cp.identifier.clone()).unwrap_or_default();
            if stream_metrics.is_none() {
                stream_metrics = Some(metrics::StreamConnectionMetrics::new(control_plane_identifier.clone()));
            }

            metrics::discovery_responses(&control_plane_identifier, &response.type_url).inc();
            tracing::debug!(
                version = &*response.version_info,
                r#type = &*response.type_url,
                nonce = &*response.nonce,
                resources = response.resources.len(),
                "received response"
            );

            let result = ResourceType::try_from(&*response.type_url)
                .and_then(|resource_type| resource_type.apply_all(&config, &response.resources));

            let error_detail = if let Err(error) = result {
                tracing::warn!(%error, r#type = &*response.type_url, "rejecting discovery response");
                metrics::nacks(&control_plane_identifier, &response.type_url).inc();
                Some(ErrorDetail {
                    code: INVALID_ARGUMENT,
                    message: error.to_string(),
                })
            } else {
                metrics::acks(&control_plane_identifier, &response.type_url).inc();
                None
            };

            yield DiscoveryRequest {
                version_info: response.version_info,
                type_url: response.type_url,
                response_nonce: response.nonce,
                error_detail,
                ..Default::default()
            };
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::prost::encode_any,
        mesh::{Endpoint as MeshEndpoint, ServiceDefinition},
        net::xds::{proto, Resource},
    };
    use pretty_assertions::assert_eq;

    fn response(resources: Vec<prost_types::Any>) -> tonic::Result<DiscoveryResponse> {
        Ok(DiscoveryResponse {
            version_info: "7".into(),
            resources,
            type_url: ResourceType::Service.type_url().into(),
            nonce: uuid::Uuid::new_v4().to_string(),
            control_plane: Some(proto::ControlPlane {
                identifier: "test".into(),
            }),
        })
    }

    #[tokio::test]
    async fn acks_valid_and_nacks_invalid_responses() {
        let config = Arc::new(Config::default());
        let service = ServiceDefinition {
            name: "reviews".into(),
            endpoints: [MeshEndpoint::new("127.0.0.1:9080".parse().unwrap())].into(),
        };
        let valid = prost_types::Any::try_from(Resource::Service(service)).unwrap();
        let invalid = encode_any(
            ResourceType::Service.type_url(),
            &proto::Service {
                name: "ratings".into(),
                endpoints: vec![proto::Endpoint {
                    address: "not an address".into(),
                    ..<_>::default()
                }],
            },
        )
        .unwrap();

        let first = response(vec![valid]);
        let second = response(vec![invalid]);
        let nonces = [
            first.as_ref().unwrap().nonce.clone(),
            second.as_ref().unwrap().nonce.clone(),
        ];

        let requests: Vec<_> =
            handle_discovery_responses(tokio_stream::iter(vec![first, second]), config.clone())
                .collect()
                .await;

        let ack = requests[0].as_ref().unwrap();
        assert_eq!(nonces[0], ack.response_nonce);
        assert_eq!("7", ack.version_info);
        assert!(ack.error_detail.is_none());

        let nack = requests[1].as_ref().unwrap();
        assert_eq!(nonces[1], nack.response_nonce);
        assert_eq!(INVALID_ARGUMENT, nack.error_detail.as_ref().unwrap().code);

        // The rejected response did not replace the accepted one.
        assert_eq!(1, config.services.read().num_of_endpoints());
        assert!(config.services.read().get("reviews").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_once_then_gives_up_when_idle() {
        let interval = Duration::from_secs(10);
        let node = Node {
            id: "reviews-1".into(),
            ..Node::default()
        };
        let healthy = Arc::new(AtomicBool::new(false));
        let (requests, mut sent) = mpsc::unbounded_channel();
        let (acks_tx, acks_rx) = mpsc::unbounded_channel::<Result<DiscoveryRequest>>();

        let session = tokio::spawn({
            let healthy = healthy.clone();
            async move {
                run_session(
                    &node,
                    &requests,
                    tokio_stream::wrappers::UnboundedReceiverStream::new(acks_rx),
                    &healthy,
                    interval,
                )
                .await
            }
        });

        acks_tx
            .send(Ok(DiscoveryRequest {
                response_nonce: "1".into(),
                ..<_>::default()
            }))
            .unwrap();
        assert_eq!("1", sent.recv().await.unwrap().response_nonce);
        assert!(healthy.load(Ordering::SeqCst));

        // One silent interval: every type is requested again.
        let start = tokio::time::Instant::now();
        for resource_type in ResourceType::VARIANTS {
            let request = sent.recv().await.unwrap();
            assert_eq!(resource_type.type_url(), request.type_url);
            assert!(request.response_nonce.is_empty());
            assert!(request.node.is_some());
        }
        assert!(start.elapsed() >= interval);

        // A second silent interval ends the session.
        session.await.unwrap();
        assert!(start.elapsed() >= interval * 2);
        drop(acks_tx);
    }
}

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

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use cached::{Cached, TimedSizedCache};
use enum_map::EnumMap;
use futures::Stream;
use tokio_stream::StreamExt;
use tracing_futures::Instrument;

use super::{
    metrics,
    proto::{
        mesh_discovery_service_server::{MeshDiscoveryService, MeshDiscoveryServiceServer},
        DiscoveryRequest, DiscoveryResponse, Node,
    },
    ResourceType,
};
use crate::{
    config::Config,
    mesh::{Endpoint, Identity},
};

/// How many unacknowledged responses a stream remembers.
const PENDING_ACKS: usize = 50;
/// How long, in seconds, a response nonce can be acknowledged.
const ACK_LIFESPAN_SECS: u64 = 60;

pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, tonic::Status>> + Send>>;

/// Serves the mesh's configuration to sidecars and tracks the sidecars
/// registered through their discovery streams.
#[derive(Clone)]
pub struct ControlPlane {
    config: Arc<Config>,
    watchers: Arc<EnumMap<ResourceType, Watchers>>,
}

struct Watchers {
    sender: tokio::sync::watch::Sender<()>,
    version: AtomicU64,
}

impl Default for Watchers {
    fn default() -> Self {
        Self {
            sender: tokio::sync::watch::channel(()).0,
            version: <_>::default(),
        }
    }
}

impl ControlPlane {
    /// Creates a control plane serving `config`, pushing a new version of a
    /// resource type to every subscribed stream whenever it changes.
    pub fn from_arc(config: Arc<Config>) -> Self {
        let this = Self {
            config,
            watchers: Default::default(),
        };

        tokio::spawn({
            let this = this.clone();
            async move {
                let mut service_watcher = this.config.services.watch();
                tracing::trace!("waiting for changes");
                while service_watcher.changed().await.is_ok() {
                    this.push_update(ResourceType::Service);
                }
                tracing::debug!("service registry dropped, stopping watch");
            }
            .instrument(tracing::debug_span!("control_plane_watch_services"))
        });

        this.config.routes.watch({
            let this = this.clone();
            move |_| this.push_update(ResourceType::Route)
        });

        this.config.policies.watch({
            let this = this.clone();
            move |_| this.push_update(ResourceType::Policy)
        });

        this
    }

    pub fn into_service(self) -> MeshDiscoveryServiceServer<Self> {
        MeshDiscoveryServiceServer::new(self)
    }

    fn push_update(&self, resource_type: ResourceType) {
        let watchers = &self.watchers[resource_type];
        watchers.version.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%resource_type, watchers = watchers.sender.receiver_count(), "pushing update");
        watchers.sender.send_replace(());
    }

    /// The current version of `resource_type`.
    pub fn version(&self, resource_type: ResourceType) -> u64 {
        self.watchers[resource_type].version.load(Ordering::Relaxed)
    }

    pub(crate) fn discovery_response(
        &self,
        resource_type: ResourceType,
    ) -> Result<DiscoveryResponse, tonic::Status> {
        let resources = resource_type
            .encode_all(&self.config)
            .map_err(|error| tonic::Status::internal(error.to_string()))?;

        let response = DiscoveryResponse {
            resources,
            nonce: uuid::Uuid::new_v4().to_string(),
            version_info: self.version(resource_type).to_string(),
            control_plane: Some(super::proto::ControlPlane {
                identifier: self.config.id(),
            }),
            type_url: resource_type.type_url().to_owned(),
        };

        tracing::trace!(
            version = &*response.version_info,
            r#type = &*response.type_url,
            nonce = &*response.nonce,
            resources = response.resources.len(),
            "discovery response"
        );

        Ok(response)
    }

    /// Registers the node's endpoint when it advertises a service and an
    /// address. The returned guard removes it again once dropped.
    ///
    /// A node advertising an unspecified IP (`0.0.0.0`, `::`) is registered
    /// under the IP it connected from.
    fn register(
        &self,
        node: &Node,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Option<Registration>, tonic::Status> {
        if node.service.is_empty() || node.address.is_empty() {
            return Ok(None);
        }

        let mut address: SocketAddr = node.address.parse().map_err(|error| {
            tonic::Status::invalid_argument(format!("invalid node address `{}`: {error}", node.address))
        })?;

        if address.ip().is_unspecified() {
            let Some(remote_addr) = remote_addr else {
                return Err(tonic::Status::invalid_argument(format!(
                    "node address `{address}` is unspecified and the peer address is unknown"
                )));
            };
            tracing::debug!(advertised = %address, peer = %remote_addr.ip(), "resolving unspecified node address");
            address.set_ip(remote_addr.ip());
        }

        let mut endpoint = Endpoint::new(address)
            .with_labels(node.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        if !node.identity.is_empty() {
            let identity: Identity = node.identity.parse().map_err(|error| {
                tonic::Status::invalid_argument(format!("invalid node identity: {error}"))
            })?;
            endpoint = endpoint.with_identity(identity);
        }

        tracing::info!(service = %node.service, %address, "registering sidecar");
        self.config
            .services
            .modify(|services| services.register(&*node.service, endpoint))
            .map_err(|error| tonic::Status::already_exists(error.to_string()))?;

        Ok(Some(Registration {
            config: self.config.clone(),
            service: node.service.clone(),
            address,
        }))
    }

    pub async fn stream_resources<S>(&self, streaming: S) -> Result<ResponseStream, tonic::Status>
    where
        S: Stream<Item = Result<DiscoveryRequest, tonic::Status>>
            + Send
            + std::marker::Unpin
            + 'static,
    {
        self.stream_resources_from(None, streaming).await
    }

    /// Like [`Self::stream_resources`], for a stream opened from
    /// `remote_addr`.
    pub async fn stream_resources_from<S>(
        &self,
        remote_addr: Option<SocketAddr>,
        mut streaming: S,
    ) -> Result<ResponseStream, tonic::Status>
    where
        S: Stream<Item = Result<DiscoveryRequest, tonic::Status>>
            + Send
            + std::marker::Unpin
            + 'static,
    {
        tracing::trace!("starting stream");
        let message = streaming.next().await.ok_or_else(|| {
            tracing::error!("No message found");
            tonic::Status::invalid_argument("No message found")
        })??;

        let Some(node) = message.node.clone() else {
            tracing::error!("Node identifier was not found");
            return Err(tonic::Status::invalid_argument("Node identifier required"));
        };

        let registration = self.register(&node, remote_addr)?;
        let connected = ConnectedSidecar::new();
        let mut state = StreamState::new(node.id.clone());
        let this = Self::clone(self);

        let mut service_rx = self.watchers[ResourceType::Service].sender.subscribe();
        let mut route_rx = self.watchers[ResourceType::Route].sender.subscribe();
        let mut policy_rx = self.watchers[ResourceType::Policy].sender.subscribe();

        tracing::debug!(id = %node.id, service = %node.service, "initial request");
        let initial = state.handle(&message);

        Ok(Box::pin(async_stream::try_stream! {
            let _registration = registration;
            let _connected = connected;

            if let Some(resource_type) = initial {
                yield state.track(this.discovery_response(resource_type)?);
            }

            loop {
                let resource_type = tokio::select! {
                    Ok(()) = service_rx.changed(), if state.is_subscribed(ResourceType::Service) => ResourceType::Service,
                    Ok(()) = route_rx.changed(), if state.is_subscribed(ResourceType::Route) => ResourceType::Route,
                    Ok(()) = policy_rx.changed(), if state.is_subscribed(ResourceType::Policy) => ResourceType::Policy,
                    new_message = streaming.next() => {
                        let new_message = match new_message.transpose() {
                            Ok(Some(value)) => value,
                            Ok(None) => break,
                            Err(error) => {
                                tracing::warn!(%error, "error receiving message");
                                break;
                            }
                        };

                        tracing::trace!("new message");
                        match state.handle(&new_message) {
                            Some(resource_type) => {
                                // The response below already carries the
                                // latest state.
                                match resource_type {
                                    ResourceType::Service => service_rx.borrow_and_update(),
                                    ResourceType::Route => route_rx.borrow_and_update(),
                                    ResourceType::Policy => policy_rx.borrow_and_update(),
                                };
                                resource_type
                            }
                            None => continue,
                        }
                    }
                };

                tracing::trace!(%resource_type, "sending discovery response");
                yield state.track(this.discovery_response(resource_type)?);
            }

            tracing::info!("terminating stream");
        }.instrument(tracing::info_span!("xds_stream", id = %node.id, service = %node.service))))
    }
}

#[tonic::async_trait]
impl MeshDiscoveryService for ControlPlane {
    type StreamResourcesStream = ResponseStream;

    #[tracing::instrument(skip_all)]
    async fn stream_resources(
        &self,
        request: tonic::Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> Result<tonic::Response<Self::StreamResourcesStream>, tonic::Status> {
        let remote_addr = request.remote_addr();
        Ok(tonic::Response::new(
            self.stream_resources_from(remote_addr, request.into_inner())
                .in_current_span()
                .await?,
        ))
    }
}

/// Per stream bookkeeping of subscriptions and unacknowledged responses.
struct StreamState {
    node_id: String,
    subscribed: EnumMap<ResourceType, bool>,
    pending_acks: TimedSizedCache<String, ResourceType>,
}

impl StreamState {
    fn new(node_id: String) -> Self {
        Self {
            node_id,
            subscribed: EnumMap::default(),
            pending_acks: TimedSizedCache::with_size_and_lifespan(PENDING_ACKS, ACK_LIFESPAN_SECS),
        }
    }

    fn is_subscribed(&self, resource_type: ResourceType) -> bool {
        self.subscribed[resource_type]
    }

    /// Processes a request, returning the resource type to respond with, if
    /// any. Requests with an empty nonce subscribe; requests echoing a nonce
    /// acknowledge (or reject) an earlier response and are not answered.
    fn handle(&mut self, request: &DiscoveryRequest) -> Option<ResourceType> {
        let resource_type = match ResourceType::try_from(&*request.type_url) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%error, url = %request.type_url, "unknown resource type");
                return None;
            }
        };

        let type_url = resource_type.type_url();
        metrics::discovery_requests(&self.node_id, type_url).inc();

        if let Some(error) = &request.error_detail {
            metrics::nacks(&self.node_id, type_url).inc();
            tracing::error!(nonce = %request.response_nonce, version = %request.version_info, code = error.code, message = %error.message, "NACK");
            return None;
        }

        if !request.response_nonce.is_empty() {
            if self.pending_acks.cache_get(&request.response_nonce).is_some() {
                metrics::acks(&self.node_id, type_url).inc();
                tracing::debug!(nonce = %request.response_nonce, version = %request.version_info, "ACK");
            } else {
                tracing::trace!(nonce = %request.response_nonce, "Unknown nonce: could not be found in cache");
            }
            return None;
        }

        tracing::debug!(%resource_type, "subscribed");
        self.subscribed[resource_type] = true;
        Some(resource_type)
    }

    fn track(&mut self, response: DiscoveryResponse) -> DiscoveryResponse {
        if let Ok(resource_type) = ResourceType::try_from(&*response.type_url) {
            self.pending_acks
                .cache_set(response.nonce.clone(), resource_type);
        }
        response
    }
}

/// Keeps a sidecar's endpoint registered while its stream is open.
struct Registration {
    config: Arc<Config>,
    service: String,
    address: SocketAddr,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let address = self.address;
        let removed = self
            .config
            .services
            .modify(|services| services.deregister(address));
        tracing::info!(service = %self.service, %address, removed, "sidecar stream closed, deregistering");
    }
}

struct ConnectedSidecar;

impl ConnectedSidecar {
    fn new() -> Self {
        metrics::connected_sidecars().inc();
        Self
    }
}

impl Drop for ConnectedSidecar {
    fn drop(&mut self) {
        metrics::connected_sidecars().dec();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        mesh::{Route, ServiceDefinition},
        net::xds::proto::ErrorDetail,
    };

    const TIMEOUT_DURATION: Duration = Duration::from_secs(10);

    fn node(service: &str, address: &str) -> Node {
        Node {
            id: format!("{service}-sidecar"),
            service: service.into(),
            address: address.into(),
            identity: format!("{service}.default.serviceaccount.identity.cluster.local"),
            ..Node::default()
        }
    }

    fn subscribe(node: Option<Node>, resource_type: ResourceType) -> DiscoveryRequest {
        DiscoveryRequest {
            node,
            type_url: resource_type.type_url().into(),
            ..DiscoveryRequest::default()
        }
    }

    async fn next(stream: &mut ResponseStream) -> DiscoveryResponse {
        timeout(TIMEOUT_DURATION, stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    /// Registering a sidecar pushes a service update concurrently with the
    /// test's own requests, so skip responses of other types.
    async fn next_of(stream: &mut ResponseStream, resource_type: ResourceType) -> DiscoveryResponse {
        loop {
            let message = next(stream).await;
            if message.type_url == resource_type.type_url() {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn node_is_required() {
        let control_plane = ControlPlane::from_arc(Arc::new(Config::default()));
        let requests = tokio_stream::iter(vec![Ok(subscribe(None, ResourceType::Service))]);

        let error = control_plane.stream_resources(requests).await.err().unwrap();
        assert_eq!(tonic::Code::InvalidArgument, error.code());
    }

    #[tokio::test]
    async fn subscribe_ack_and_push() {
        let config = Arc::new(Config::default());
        config.services.modify(|services| {
            services.replace([ServiceDefinition {
                name: "ratings".into(),
                endpoints: [Endpoint::new("127.0.0.1:9080".parse().unwrap())].into(),
            }])
        });
        let control_plane = ControlPlane::from_arc(config.clone());
        let (tx, rx) = tokio::sync::mpsc::channel(256);

        tx.send(Ok(subscribe(
            Some(node("reviews", "127.0.0.1:15006")),
            ResourceType::Service,
        )))
        .await
        .unwrap();

        let mut stream = timeout(
            TIMEOUT_DURATION,
            control_plane.stream_resources(tokio_stream::wrappers::ReceiverStream::new(rx)),
        )
        .await
        .unwrap()
        .unwrap();

        let message = next(&mut stream).await;
        assert_eq!(ResourceType::Service.type_url(), message.type_url);
        // The registered sidecar plus the configured ratings service.
        assert_eq!(2, message.resources.len());
        assert!(config.services.read().get("reviews").is_some());

        // ACK, then subscribe to routes.
        tx.send(Ok(DiscoveryRequest {
            response_nonce: message.nonce.clone(),
            version_info: message.version_info.clone(),
            ..subscribe(None, ResourceType::Service)
        }))
        .await
        .unwrap();
        tx.send(Ok(subscribe(None, ResourceType::Route))).await.unwrap();

        let message = next_of(&mut stream, ResourceType::Route).await;
        assert_eq!(ResourceType::Route.type_url(), message.type_url);
        assert!(message.resources.is_empty());

        // A NACK is never answered, the next response is the pushed update.
        tx.send(Ok(DiscoveryRequest {
            response_nonce: message.nonce.clone(),
            error_detail: Some(ErrorDetail {
                code: 3,
                message: "invalid".into(),
            }),
            ..subscribe(None, ResourceType::Route)
        }))
        .await
        .unwrap();

        config
            .routes
            .modify(|routes| routes.insert(Route::default_for("ratings")));

        let message = next_of(&mut stream, ResourceType::Route).await;
        assert_eq!(1, message.resources.len());
        assert_eq!(control_plane.version(ResourceType::Route).to_string(), message.version_info);
    }

    #[tokio::test]
    #[traced_test]
    async fn registration_ends_with_stream() {
        let config = Arc::new(Config::default());
        let control_plane = ControlPlane::from_arc(config.clone());
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        tx.send(Ok(subscribe(
            Some(node("reviews", "127.0.0.1:15006")),
            ResourceType::Service,
        )))
        .await
        .unwrap();

        let mut stream = control_plane
            .stream_resources(tokio_stream::wrappers::ReceiverStream::new(rx))
            .await
            .unwrap();
        next(&mut stream).await;
        assert_eq!(1, config.services.read().num_of_endpoints());
        assert!(logs_contain("registering sidecar"));

        drop(tx);
        while timeout(TIMEOUT_DURATION, stream.next()).await.unwrap().is_some() {}
        drop(stream);
        assert!(config.services.read().is_empty());
    }

    #[tokio::test]
    async fn unspecified_addresses_resolve_to_the_peer() {
        let config = Arc::new(Config::default());
        let control_plane = ControlPlane::from_arc(config.clone());

        let mut streams = Vec::new();
        for (service, peer) in [("reviews", "10.0.0.1:41000"), ("ratings", "10.0.0.2:41000")] {
            let (tx, rx) = tokio::sync::mpsc::channel(256);
            tx.send(Ok(subscribe(
                Some(node(service, "0.0.0.0:15006")),
                ResourceType::Service,
            )))
            .await
            .unwrap();
            let mut stream = control_plane
                .stream_resources_from(
                    Some(peer.parse().unwrap()),
                    tokio_stream::wrappers::ReceiverStream::new(rx),
                )
                .await
                .unwrap();
            next(&mut stream).await;
            streams.push((tx, stream));
        }

        let addresses = |service: &str| -> Vec<SocketAddr> {
            config
                .services
                .load()
                .get(service)
                .unwrap_or_default()
                .into_iter()
                .map(|endpoint| endpoint.address)
                .collect()
        };
        assert_eq!(vec!["10.0.0.1:15006".parse::<SocketAddr>().unwrap()], addresses("reviews"));
        assert_eq!(vec!["10.0.0.2:15006".parse::<SocketAddr>().unwrap()], addresses("ratings"));

        // Without a peer address there is nothing to resolve against.
        let requests = tokio_stream::iter(vec![Ok(subscribe(
            Some(node("details", "[::]:15006")),
            ResourceType::Service,
        ))]);
        let error = control_plane.stream_resources(requests).await.err().unwrap();
        assert_eq!(tonic::Code::InvalidArgument, error.code());
    }

    #[tokio::test]
    async fn live_address_cannot_be_taken_by_another_service() {
        let config = Arc::new(Config::default());
        let control_plane = ControlPlane::from_arc(config.clone());

        let (tx, rx) = tokio::sync::mpsc::channel(256);
        tx.send(Ok(subscribe(
            Some(node("reviews", "10.0.0.1:15006")),
            ResourceType::Service,
        )))
        .await
        .unwrap();
        let mut stream = control_plane
            .stream_resources(tokio_stream::wrappers::ReceiverStream::new(rx))
            .await
            .unwrap();
        next(&mut stream).await;

        let requests = tokio_stream::iter(vec![Ok(subscribe(
            Some(node("ratings", "10.0.0.1:15006")),
            ResourceType::Service,
        ))]);
        let error = control_plane.stream_resources(requests).await.err().unwrap();
        assert_eq!(tonic::Code::AlreadyExists, error.code());

        assert!(config.services.load().get("reviews").is_some());
        assert!(config.services.load().get("ratings").is_none());
        drop(tx);
    }

    #[tokio::test]
    async fn invalid_registration_is_rejected() {
        let control_plane = ControlPlane::from_arc(Arc::new(Config::default()));
        let requests = tokio_stream::iter(vec![Ok(subscribe(
            Some(node("reviews", "not-an-address")),
            ResourceType::Service,
        ))]);

        let error = control_plane.stream_resources(requests).await.err().unwrap();
        assert_eq!(tonic::Code::InvalidArgument, error.code());
    }
}

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

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::TcpListener;

use trellis::{
    components::{
        control_plane::{self, ControlPlane},
        sidecar::{self, Sidecar, Upstream},
        RunArgs,
    },
    pki::CertificateAuthority,
    signal::{ShutdownKind, ShutdownRx, ShutdownTx},
    telemetry::{Outcome, Recorder},
    test::{eventually, identity_in, run_echo_server, send_and_receive},
    Config,
};

const MESH_CONFIG: &str = r#"
version: v1alpha1
routes:
  - service: reviews
    splits:
      - labels:
          version: v1
        weight: 0
      - labels:
          version: v2
        weight: 100
policies:
  - service: reviews
    mtls: STRICT
    rules:
      - action: ALLOW
        principals:
          - productpage.default.serviceaccount.identity.cluster.local
"#;

struct RunningSidecar {
    config: Arc<Config>,
    ready: sidecar::Ready,
    inbound: SocketAddr,
    upstreams: Vec<SocketAddr>,
}

async fn bind() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").await.unwrap()
}

async fn spawn_control_plane(
    dir: &tempfile::TempDir,
    shutdown_rx: ShutdownRx,
) -> (SocketAddr, control_plane::Ready) {
    let path = dir.path().join("trellis.yaml");
    std::fs::write(&path, MESH_CONFIG).unwrap();

    let listener = bind().await;
    let address = listener.local_addr().unwrap();
    let ready = control_plane::Ready::default();
    let (initialized_tx, initialized_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(
        ControlPlane {
            listener,
            config_path: Some(path),
            authority: Arc::new(
                CertificateAuthority::generate("cluster.local")
                    .unwrap()
                    .with_bootstrap_token("mesh-token"),
            ),
        }
        .run(
            RunArgs {
                config: Arc::new(Config::default()),
                ready: ready.clone(),
                shutdown_rx,
            },
            Some(initialized_tx),
        ),
    );
    initialized_rx.await.unwrap();

    (address, ready)
}

async fn spawn_sidecar(
    control_plane: SocketAddr,
    service: &str,
    version: &str,
    app: SocketAddr,
    upstreams: &[&str],
    shutdown_rx: ShutdownRx,
) -> RunningSidecar {
    let inbound = bind().await;
    let inbound_address = inbound.local_addr().unwrap();

    let mut listeners = Vec::new();
    let mut addresses = Vec::new();
    for upstream in upstreams {
        let listener = bind().await;
        addresses.push(listener.local_addr().unwrap());
        listeners.push(Upstream {
            service: (*upstream).into(),
            listener,
        });
    }

    let config = Arc::new(Config::default());
    let ready = sidecar::Ready {
        idle_request_interval: Duration::from_secs(5),
        ..<_>::default()
    };
    let (initialized_tx, initialized_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(
        Sidecar {
            service: service.into(),
            identity: identity_in(service, "cluster.local"),
            labels: [("version".to_owned(), version.to_owned())].into(),
            inbound,
            advertise_address: None,
            app_address: app,
            upstreams: listeners,
            management_servers: vec![format!("http://{control_plane}").parse().unwrap()],
            ca_token: "mesh-token".into(),
            certificate_ttl: Duration::from_secs(600),
            report_interval: Duration::from_millis(200),
            recorder: Recorder::default(),
            tls: <_>::default(),
        }
        .run(
            RunArgs {
                config: config.clone(),
                ready: ready.clone(),
                shutdown_rx,
            },
            Some(initialized_tx),
        ),
    );
    initialized_rx.await.unwrap();

    RunningSidecar {
        config,
        ready,
        inbound: inbound_address,
        upstreams: addresses,
    }
}

fn shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    trellis::signal::channel(ShutdownKind::Testing)
}

#[tokio::test]
async fn traffic_flows_through_the_mesh() {
    let dir = tempfile::tempdir().unwrap();
    let (_shutdown_tx, shutdown_rx) = shutdown_channel();
    let (control_plane, control_plane_ready) = spawn_control_plane(&dir, shutdown_rx.clone()).await;

    let reviews_v1 = run_echo_server("reviews-v1:").await;
    let reviews_v2 = run_echo_server("reviews-v2:").await;
    let productpage_app = run_echo_server("productpage:").await;

    let v1 = spawn_sidecar(control_plane, "reviews", "v1", reviews_v1, &[], shutdown_rx.clone()).await;
    let v2 = spawn_sidecar(control_plane, "reviews", "v2", reviews_v2, &[], shutdown_rx.clone()).await;
    let productpage = spawn_sidecar(
        control_plane,
        "productpage",
        "v1",
        productpage_app,
        &["reviews"],
        shutdown_rx.clone(),
    )
    .await;

    for sidecar in [&v1, &v2, &productpage] {
        eventually("sidecar ready", || sidecar.ready.is_ready()).await;
    }
    eventually("both reviews instances discovered", || {
        productpage
            .config
            .services
            .read()
            .get("reviews")
            .map_or(false, |endpoints| endpoints.len() == 2)
    })
    .await;
    eventually("policy discovered", || v2.config.policies.load().contains("reviews")).await;
    eventually("route discovered", || {
        productpage.config.routes.load().contains("reviews")
    })
    .await;

    // Every request lands on v2.
    for _ in 0..3 {
        let received = send_and_receive(productpage.upstreams[0], b"hello", 16).await;
        assert_eq!(b"reviews-v2:hello".as_slice(), &received);
    }

    // The reviews policy only admits productpage, never plaintext.
    let received = send_and_receive(v1.inbound, b"plaintext", 20).await;
    assert!(received.is_empty());

    // Both sides report the edge. The inbound side names productpage from
    // its certificate, so the connections were mutually authenticated.
    eventually("service graph edge", || {
        control_plane_ready
            .aggregator
            .edge("productpage", "reviews")
            .map_or(false, |edge| {
                edge.outbound.connections == 3 && edge.inbound.connections == 3
            })
    })
    .await;
    let edge = control_plane_ready
        .aggregator
        .edge("productpage", "reviews")
        .unwrap();
    assert_eq!(Some(&3), edge.inbound.outcomes.get(Outcome::Success.as_str()));
    assert_eq!(3 * 5, edge.outbound.bytes_sent);

    eventually("denied plaintext edge", || {
        control_plane_ready
            .aggregator
            .edge("unknown", "reviews")
            .map_or(false, |edge| {
                edge.inbound.outcomes.get(Outcome::Denied.as_str()) == Some(&1)
            })
    })
    .await;

    let graph = control_plane_ready.aggregator.graph();
    assert!(graph.nodes.iter().any(|node| node.service == "productpage"));
    assert!(graph.nodes.iter().filter(|node| node.service == "reviews").count() == 2);
}

#[tokio::test]
async fn certificate_requests_need_the_bootstrap_token() {
    let dir = tempfile::tempdir().unwrap();
    let (_shutdown_tx, shutdown_rx) = shutdown_channel();
    let (control_plane, _) = spawn_control_plane(&dir, shutdown_rx).await;

    let rotator = trellis::pki::Rotator::new(
        identity_in("intruder", "cluster.local"),
        vec![format!("http://{control_plane}").parse().unwrap()],
        <_>::default(),
    );
    assert!(rotator.request().await.is_err());

    let certificate = rotator
        .with_token("mesh-token")
        .request()
        .await
        .unwrap();
    assert_eq!("intruder", certificate.identity().account());
}

#[tokio::test]
async fn deregisters_when_sidecar_stops() {
    let dir = tempfile::tempdir().unwrap();
    let (_shutdown_tx, shutdown_rx) = shutdown_channel();
    let (control_plane, _) = spawn_control_plane(&dir, shutdown_rx.clone()).await;

    let observer = spawn_sidecar(
        control_plane,
        "productpage",
        "v1",
        run_echo_server("productpage:").await,
        &[],
        shutdown_rx,
    )
    .await;

    let (ratings_shutdown_tx, ratings_shutdown_rx) = shutdown_channel();
    let _ratings = spawn_sidecar(
        control_plane,
        "ratings",
        "v1",
        run_echo_server("ratings:").await,
        &[],
        ratings_shutdown_rx,
    )
    .await;

    eventually("ratings registered", || {
        observer.config.services.read().get("ratings").is_some()
    })
    .await;

    ratings_shutdown_tx.send(ShutdownKind::Normal).unwrap();
    eventually("ratings deregistered", || {
        observer
            .config
            .services
            .read()
            .get("ratings")
            .map_or(true, |endpoints| endpoints.is_empty())
    })
    .await;
}

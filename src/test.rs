/*
 * Copyright 2020 Google LLC
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

//! Common utilities for testing

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    mesh::{identity::DEFAULT_NAMESPACE, Identity},
    pki::{workload::generate_csr, CertificateAuthority, WorkloadCertificate},
};

/// Returns a loopback address with a port that was free when this was called.
pub async fn available_addr() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let address = listener.local_addr().unwrap();
    tracing::debug!(%address, "test::available_addr");
    address
}

/// The identity of `account` in the default namespace of `trust_domain`.
pub fn identity_in(account: &str, trust_domain: &str) -> Identity {
    Identity::new(account, DEFAULT_NAMESPACE, trust_domain).unwrap()
}

/// Issues a certificate for `account` in the authority's trust domain.
pub fn issue(ca: &CertificateAuthority, account: &str) -> WorkloadCertificate {
    issue_with_ttl(ca, account, Duration::ZERO)
}

pub fn issue_with_ttl(ca: &CertificateAuthority, account: &str, ttl: Duration) -> WorkloadCertificate {
    let identity = identity_in(account, ca.trust_domain());
    let (csr, key) = generate_csr(&identity).unwrap();
    let issued = ca.sign(&csr, "", ttl).unwrap();
    WorkloadCertificate::new(identity, key, issued.chain_pem, ca.trust_bundle_pem().into())
        .unwrap()
}

/// Runs a TCP server that echoes back everything it reads, prefixed with
/// `name` once per connection so tests can tell servers apart.
pub async fn run_echo_server(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let address = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };

            tokio::spawn(async move {
                let mut buf = vec![0; 1024];
                if stream.write_all(name.as_bytes()).await.is_err() {
                    return;
                }
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    address
}

/// Connects to `address`, sends `message` and returns everything received
/// until `expected_len` bytes arrived or the connection closed.
pub async fn send_and_receive(address: SocketAddr, message: &[u8], expected_len: usize) -> Vec<u8> {
    let mut stream = TcpStream::connect(address).await.unwrap();
    stream.write_all(message).await.unwrap();

    let mut received = Vec::with_capacity(expected_len);
    let mut buf = vec![0; 1024];
    tokio::time::timeout(Duration::from_secs(5), async {
        while received.len() < expected_len {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await
    .ok();

    received
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

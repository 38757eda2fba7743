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

//! The listener peers connect to. Terminates mTLS, enforces the local
//! service's policy and forwards to the application.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    time::Instant,
};
use tracing::Instrument;

use super::{metrics, Context, ProxyError};
use crate::{
    mesh::{policy::Peer, route::DEFAULT_CONNECT_TIMEOUT_MS, MtlsMode},
    pki::tls::TLS_HANDSHAKE_RECORD,
    telemetry::{aggregator::UNKNOWN_SERVICE, ConnectionRecord, Direction},
};

/// How long to wait for a client's first byte before treating the
/// connection as plaintext.
pub const PROTOCOL_DETECTION_TIMEOUT: Duration = Duration::from_secs(1);

pub(super) async fn serve(listener: TcpListener, context: Arc<Context>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let span = tracing::debug_span!("inbound", %peer);
                tokio::spawn(handle(context.clone(), stream, peer).instrument(span));
            }
            Err(error) => {
                tracing::warn!(%error, "failed to accept inbound connection");
            }
        }
    }
}

async fn handle(context: Arc<Context>, stream: TcpStream, peer: SocketAddr) {
    let _active = metrics::ActiveConnection::new(Direction::Inbound);
    let start = Instant::now();

    // Replaced by the peer's account once a TLS handshake names it.
    let mut record =
        ConnectionRecord::new(Direction::Inbound, UNKNOWN_SERVICE, context.service.clone());
    record.destination_identity = Some(context.identity.clone());
    record.upstream = Some(context.app_address);
    record.attempts = 1;

    let Some(is_tls) = detect_tls(&stream).await else {
        tracing::trace!("connection closed before sending data");
        return;
    };

    if let Err(error) = proxy(&context, stream, peer, is_tls, &mut record).await {
        tracing::debug!(%error, "inbound connection failed");
        metrics::errors_total(Direction::Inbound, error.discriminant()).inc();
        record.outcome = error.outcome();
    }

    record.duration = start.elapsed();
    context.finish(record);
}

/// Peeks at the first byte, `None` meaning the client went away without
/// sending anything.
async fn detect_tls(stream: &TcpStream) -> Option<bool> {
    let mut first = [0; 1];
    match tokio::time::timeout(PROTOCOL_DETECTION_TIMEOUT, stream.peek(&mut first)).await {
        Ok(Ok(0)) | Ok(Err(_)) => None,
        Ok(Ok(_)) => Some(first[0] == TLS_HANDSHAKE_RECORD),
        // Server speaks first protocols never send a TLS record.
        Err(_) => Some(false),
    }
}

async fn proxy(
    context: &Context,
    stream: TcpStream,
    peer: SocketAddr,
    is_tls: bool,
    record: &mut ConnectionRecord,
) -> Result<(), ProxyError> {
    let policy = context.config.policies.load().get(&context.service);

    if is_tls {
        if policy.mtls == MtlsMode::Disable {
            return Err(ProxyError::TlsDisabled);
        }

        let tls = context.tls.load_full().ok_or(ProxyError::NoCertificate)?;
        let (stream, identity) = tls
            .accept(stream)
            .await
            .map_err(|source| ProxyError::Tls {
                address: peer,
                source,
            })?;

        if let Some(identity) = &identity {
            record.source_service = identity.account().to_owned();
        }
        record.source_identity = identity.clone();
        authorize(&policy, Peer {
            identity,
            address: peer.ip(),
        })?;
        forward(context, stream, record).await
    } else {
        if !policy.mtls.accepts_plaintext() {
            return Err(ProxyError::PlaintextRejected);
        }

        authorize(&policy, Peer {
            identity: None,
            address: peer.ip(),
        })?;
        forward(context, stream, record).await
    }
}

fn authorize(policy: &crate::mesh::Policy, peer: Peer) -> Result<(), ProxyError> {
    let decision = policy.authorize(&peer);
    if decision.is_allowed() {
        Ok(())
    } else {
        tracing::debug!(?decision, identity = ?peer.identity, "connection denied");
        Err(ProxyError::Denied(decision))
    }
}

async fn forward<S>(
    context: &Context,
    mut downstream: S,
    record: &mut ConnectionRecord,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let address = context.app_address;
    let mut app = tokio::time::timeout(
        Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        TcpStream::connect(address),
    )
    .await
    .map_err(|_| ProxyError::Timeout(address))?
    .map_err(|source| ProxyError::Connect { address, source })?;
    app.set_nodelay(true)?;

    match tokio::io::copy_bidirectional(&mut downstream, &mut app).await {
        Ok((sent, received)) => {
            record.bytes_sent = sent;
            record.bytes_received = received;
        }
        Err(error) => tracing::debug!(%error, "inbound connection closed with error"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::AsyncWriteExt;

    use super::*;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_plaintext_after_timeout() {
        let (_client, server) = connected_pair().await;

        let start = Instant::now();
        assert_eq!(Some(false), detect_tls(&server).await);
        assert!(start.elapsed() >= PROTOCOL_DETECTION_TIMEOUT);
    }

    #[tokio::test]
    async fn first_byte_decides_protocol() {
        let (mut client, server) = connected_pair().await;
        client.write_all(&[TLS_HANDSHAKE_RECORD, 3, 1]).await.unwrap();
        assert_eq!(Some(true), detect_tls(&server).await);

        let (mut client, server) = connected_pair().await;
        client.write_all(b"GET / HTTP/1.1").await.unwrap();
        assert_eq!(Some(false), detect_tls(&server).await);
    }

    #[tokio::test]
    async fn closed_client_is_ignored() {
        let (client, server) = connected_pair().await;
        drop(client);
        assert_eq!(None, detect_tls(&server).await);
    }
}

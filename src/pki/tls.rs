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

//! rustls configuration for mutually authenticated connections between
//! sidecars.

use std::{io, sync::Arc};

use arc_swap::ArcSwapOption;
use rustls::{server::AllowAnyAuthenticatedClient, ClientConfig, RootCertStore, ServerConfig};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use x509_parser::extensions::GeneralName;

use super::{certificates, PkiError, WorkloadCertificate};
use crate::mesh::Identity;

/// The first byte of every TLS connection, a handshake record.
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// The TLS context currently in use, swapped on every rotation. Empty until
/// the first certificate was issued.
pub type SharedTls = Arc<ArcSwapOption<TlsContext>>;

/// Server and client configurations presenting one workload certificate.
pub struct TlsContext {
    identity: Identity,
    not_after: OffsetDateTime,
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
}

impl TlsContext {
    pub fn new(certificate: &WorkloadCertificate) -> Result<Self, PkiError> {
        let chain = certificates(certificate.chain_pem())?;
        let key = private_key(certificate.key_pem())?;

        let mut roots = RootCertStore::empty();
        for root in certificates(certificate.trust_bundle_pem())? {
            roots.add(&root)?;
        }

        let server = ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots.clone()).boxed())
            .with_single_cert(chain.clone(), key.clone())?;

        let client = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)?;

        Ok(Self {
            identity: certificate.identity().clone(),
            not_after: certificate.not_after(),
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }

    /// The identity this context presents to peers.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Completes a server side handshake, returning the stream and the
    /// identity of the client's certificate.
    pub async fn accept<IO>(
        &self,
        stream: IO,
    ) -> io::Result<(server::TlsStream<IO>, Option<Identity>)>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = TlsAcceptor::from(self.server.clone()).accept(stream).await?;
        let identity = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(peer_identity);
        Ok((stream, identity))
    }

    /// Opens a client side session that only succeeds when the server
    /// presents a certificate for `peer`.
    pub async fn connect<IO>(&self, peer: &Identity, stream: IO) -> io::Result<client::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let name = rustls::ServerName::try_from(&*peer.to_string())
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
        TlsConnector::from(self.client.clone())
            .connect(name, stream)
            .await
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("identity", &self.identity.to_string())
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

fn private_key(pem: &str) -> Result<rustls::PrivateKey, PkiError> {
    rustls_pemfile::read_all(&mut pem.as_bytes())?
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::ECKey(key)
            | rustls_pemfile::Item::RSAKey(key) => Some(rustls::PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| PkiError::Parse("no private key found in PEM".into()))
}

/// The workload identity carried as a DNS SAN of a DER encoded certificate.
pub fn identity_from_der(der: &[u8]) -> Result<Identity, PkiError> {
    let (_, certificate) = x509_parser::parse_x509_certificate(der)
        .map_err(|error| PkiError::Parse(error.to_string()))?;

    let san = certificate
        .subject_alternative_name()
        .map_err(|error| PkiError::Parse(error.to_string()))?
        .ok_or_else(|| PkiError::Parse("certificate has no subject alternative name".into()))?;

    san.value
        .general_names
        .iter()
        .find_map(|name| match name {
            GeneralName::DNSName(name) => name.parse::<Identity>().ok(),
            _ => None,
        })
        .ok_or_else(|| PkiError::Parse("certificate carries no workload identity".into()))
}

/// The identity of the leaf of a peer's certificate chain.
pub fn peer_identity(chain: &[rustls::Certificate]) -> Option<Identity> {
    chain
        .first()
        .and_then(|leaf| identity_from_der(&leaf.0).ok())
}

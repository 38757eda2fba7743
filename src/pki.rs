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

//! Workload identity certificates: the control plane's certificate
//! authority, the sidecar's side of issuance and rotation, and the rustls
//! configuration built from the resulting certificates.

pub mod authority;
pub mod rotation;
pub mod tls;
pub mod workload;

pub use self::{
    authority::CertificateAuthority,
    rotation::Rotator,
    tls::{SharedTls, TlsContext},
    workload::WorkloadCertificate,
};

pub use crate::generated::trellis::ca::v1 as proto;

#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("invalid certificate signing request: {0}")]
    InvalidCsr(String),
    #[error("identity `{identity}` is outside of trust domain `{trust_domain}`")]
    ForeignIdentity {
        identity: String,
        trust_domain: String,
    },
    #[error("a valid bootstrap token is required")]
    InvalidToken,
    #[error("failed to parse certificate: {0}")]
    Parse(String),
    #[error("certificate was issued for `{found}`, expected `{expected}`")]
    IdentityMismatch { expected: String, found: String },
    #[error(transparent)]
    Identity(#[from] crate::mesh::identity::IdentityError),
    #[error(transparent)]
    Certificate(#[from] rcgen::RcgenError),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<PkiError> for tonic::Status {
    fn from(error: PkiError) -> Self {
        match error {
            PkiError::InvalidCsr(_)
            | PkiError::ForeignIdentity { .. }
            | PkiError::Identity(_)
            | PkiError::Parse(_)
            | PkiError::IdentityMismatch { .. } => Self::invalid_argument(error.to_string()),
            PkiError::InvalidToken => Self::permission_denied(error.to_string()),
            PkiError::Certificate(_) | PkiError::Tls(_) | PkiError::Io(_) => {
                Self::internal(error.to_string())
            }
        }
    }
}

/// Decodes the first PEM block of `pem`, whatever its label.
pub(crate) fn pem_to_der(pem: &str) -> Result<Vec<u8>, PkiError> {
    x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map(|(_, pem)| pem.contents)
        .map_err(|error| PkiError::Parse(format!("invalid PEM: {error}")))
}

/// Decodes every certificate in `pem`.
pub(crate) fn certificates(pem: &str) -> Result<Vec<rustls::Certificate>, PkiError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())?;
    if certs.is_empty() {
        return Err(PkiError::Parse("no certificate found in PEM".into()));
    }

    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

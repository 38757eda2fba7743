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

//! The mesh's certificate authority.
//!
//! Sidecars generate their own keys and only ever send a CSR; the authority
//! checks the identity the CSR asks for and signs a short-lived leaf
//! certificate for it.

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequest,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use time::OffsetDateTime;
use x509_parser::{
    certification_request::X509CertificationRequest,
    extensions::{GeneralName, ParsedExtension},
    prelude::FromDer,
};

use super::{pem_to_der, proto, PkiError};
use crate::{
    mesh::Identity,
    metrics::{opts, register},
};

/// Validity of a generated root.
pub const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
/// Shortest lifetime the authority issues.
pub const MIN_CERTIFICATE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_CERTIFICATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// How far `not_before` is moved into the past to tolerate clock skew.
pub const CLOCK_SKEW: Duration = Duration::from_secs(60);

const SUBSYSTEM: &str = "ca";
const REASON_LABEL: &str = "reason";

fn certificates_issued() -> &'static IntCounter {
    static CERTIFICATES_ISSUED: Lazy<IntCounter> = Lazy::new(|| {
        register(
            IntCounter::with_opts(opts(
                "certificates_issued",
                SUBSYSTEM,
                "Total number of workload certificates issued",
            ))
            .unwrap(),
        )
    });

    &CERTIFICATES_ISSUED
}

fn requests_rejected(reason: &str) -> IntCounter {
    static REQUESTS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "requests_rejected",
                    SUBSYSTEM,
                    "Total number of rejected certificate requests",
                ),
                &[REASON_LABEL],
            )
            .unwrap(),
        )
    });

    REQUESTS_REJECTED.with_label_values(&[reason])
}

/// A leaf certificate issued by the authority.
#[derive(Clone, Debug)]
pub struct IssuedCertificate {
    pub identity: Identity,
    pub chain_pem: String,
    pub not_after: OffsetDateTime,
}

pub struct CertificateAuthority {
    root: Certificate,
    root_pem: String,
    trust_domain: String,
    max_ttl: Duration,
    bootstrap_token: Option<String>,
}

impl CertificateAuthority {
    /// Generates a new self-signed root for `trust_domain`.
    pub fn generate(trust_domain: impl Into<String>) -> Result<Self, PkiError> {
        let trust_domain = trust_domain.into();
        let now = OffsetDateTime::now_utc();

        let mut params = CertificateParams::default();
        params.distinguished_name = root_name(&trust_domain);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now + CA_VALIDITY;

        let root = Certificate::from_params(params)?;
        let root_pem = root.serialize_pem()?;
        tracing::info!(%trust_domain, "generated new root certificate");

        Ok(Self::new(root, root_pem, trust_domain))
    }

    /// Loads an existing root from its PEM encoded certificate and key.
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        trust_domain: impl Into<String>,
    ) -> Result<Self, PkiError> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key)?;
        if !matches!(params.is_ca, IsCa::Ca(_)) {
            return Err(PkiError::Parse(
                "the configured root is not a CA certificate".into(),
            ));
        }

        let root = Certificate::from_params(params)?;
        let root_pem = format!("{}\n", cert_pem.trim_end());
        Ok(Self::new(root, root_pem, trust_domain.into()))
    }

    fn new(root: Certificate, root_pem: String, trust_domain: String) -> Self {
        Self {
            root,
            root_pem,
            trust_domain,
            max_ttl: DEFAULT_MAX_CERTIFICATE_TTL,
            bootstrap_token: None,
        }
    }

    /// Caps the lifetime of issued certificates, kept between
    /// [`MIN_CERTIFICATE_TTL`] and [`CA_VALIDITY`] so expiry dates stay
    /// representable.
    pub fn with_max_ttl(mut self, max_ttl: Duration) -> Self {
        self.max_ttl = max_ttl.clamp(MIN_CERTIFICATE_TTL, CA_VALIDITY);
        self
    }

    /// Requires every request to carry `token`.
    pub fn with_bootstrap_token(mut self, token: impl Into<String>) -> Self {
        self.bootstrap_token = Some(token.into());
        self
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// The roots workloads verify each other against.
    pub fn trust_bundle_pem(&self) -> &str {
        &self.root_pem
    }

    /// The private key of the root, for persisting a generated root.
    pub fn root_key_pem(&self) -> String {
        self.root.serialize_private_key_pem()
    }

    /// The lifetime granted for a requested TTL, `0` meaning the maximum.
    pub fn granted_ttl(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.max_ttl
        } else {
            requested.clamp(MIN_CERTIFICATE_TTL, self.max_ttl)
        }
    }

    /// Signs a PEM encoded CSR.
    ///
    /// The CSR must name exactly one DNS identity inside the authority's
    /// trust domain. Everything else it asks for is ignored: subject, key
    /// usages and lifetime are always set by the authority.
    pub fn sign(
        &self,
        csr_pem: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<IssuedCertificate, PkiError> {
        if let Some(expected) = &self.bootstrap_token {
            if expected != token {
                return Err(PkiError::InvalidToken);
            }
        }

        let der = pem_to_der(csr_pem).map_err(|error| PkiError::InvalidCsr(error.to_string()))?;
        let identity = requested_identity(&der)?;
        if !identity.in_trust_domain(&self.trust_domain) {
            return Err(PkiError::ForeignIdentity {
                identity: identity.to_string(),
                trust_domain: self.trust_domain.clone(),
            });
        }

        let mut csr = CertificateSigningRequest::from_der(&der)
            .map_err(|error| PkiError::InvalidCsr(error.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let not_after = now + self.granted_ttl(ttl);
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, identity.to_string());

        let params = &mut csr.params;
        params.distinguished_name = name;
        params.subject_alt_names = vec![SanType::DnsName(identity.to_string())];
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.not_before = now - CLOCK_SKEW;
        params.not_after = not_after;

        let leaf_pem = csr.serialize_pem_with_signer(&self.root)?;
        certificates_issued().inc();
        tracing::info!(%identity, %not_after, "issued workload certificate");

        Ok(IssuedCertificate {
            identity,
            chain_pem: leaf_pem,
            not_after,
        })
    }
}

fn root_name(trust_domain: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, format!("{trust_domain} root"));
    name.push(DnType::OrganizationName, "trellis");
    name
}

/// Extracts the single DNS identity a CSR requests.
fn requested_identity(der: &[u8]) -> Result<Identity, PkiError> {
    let (_, csr) = X509CertificationRequest::from_der(der)
        .map_err(|error| PkiError::InvalidCsr(error.to_string()))?;

    let mut names = csr
        .requested_extensions()
        .into_iter()
        .flatten()
        .filter_map(|extension| match extension {
            ParsedExtension::SubjectAlternativeName(san) => Some(san),
            _ => None,
        })
        .flat_map(|san| san.general_names.iter())
        .filter_map(|name| match name {
            GeneralName::DNSName(name) => Some(*name),
            _ => None,
        });

    match (names.next(), names.next()) {
        (Some(name), None) => Ok(name.parse()?),
        (None, _) => Err(PkiError::InvalidCsr("no DNS identity requested".into())),
        (Some(_), Some(_)) => Err(PkiError::InvalidCsr(
            "exactly one DNS identity must be requested".into(),
        )),
    }
}

#[tonic::async_trait]
impl proto::certificate_service_server::CertificateService for CertificateAuthority {
    #[tracing::instrument(skip_all)]
    async fn create_certificate(
        &self,
        request: tonic::Request<proto::CertificateRequest>,
    ) -> Result<tonic::Response<proto::CertificateResponse>, tonic::Status> {
        let request = request.into_inner();
        let issued = self
            .sign(
                &request.csr,
                &request.token,
                Duration::from_secs(request.ttl_seconds),
            )
            .map_err(|error| {
                let status = tonic::Status::from(error);
                requests_rejected(&format!("{:?}", status.code())).inc();
                tracing::warn!(error = %status.message(), "rejected certificate request");
                status
            })?;

        Ok(tonic::Response::new(proto::CertificateResponse {
            cert_chain: issued.chain_pem,
            trust_bundle: self.trust_bundle_pem().to_owned(),
            expires_at: issued.not_after.unix_timestamp(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{workload, WorkloadCertificate};

    fn identity(name: &str, trust_domain: &str) -> Identity {
        Identity::new(name, "default", trust_domain).unwrap()
    }

    #[test]
    fn signs_identity_with_clamped_ttl() {
        let ca = CertificateAuthority::generate("cluster.local")
            .unwrap()
            .with_max_ttl(Duration::from_secs(3600));
        let (csr, _key) = workload::generate_csr(&identity("reviews", "cluster.local")).unwrap();

        let issued = ca
            .sign(&csr, "", Duration::from_secs(7 * 24 * 3600))
            .unwrap();
        assert_eq!("reviews", issued.identity.account());
        let lifetime = issued.not_after - OffsetDateTime::now_utc();
        assert!(lifetime <= time::Duration::seconds(3600));
        assert!(lifetime > time::Duration::seconds(3500));

        assert_eq!(MIN_CERTIFICATE_TTL, ca.granted_ttl(Duration::from_secs(1)));
        assert_eq!(Duration::from_secs(3600), ca.granted_ttl(Duration::ZERO));
    }

    #[test]
    fn huge_max_ttl_is_capped() {
        let ca = CertificateAuthority::generate("cluster.local")
            .unwrap()
            .with_max_ttl(Duration::from_secs(u64::MAX));
        assert_eq!(CA_VALIDITY, ca.granted_ttl(Duration::ZERO));
        assert_eq!(CA_VALIDITY, ca.granted_ttl(Duration::from_secs(u64::MAX)));

        let (csr, _key) = workload::generate_csr(&identity("reviews", "cluster.local")).unwrap();
        let issued = ca.sign(&csr, "", Duration::from_secs(u64::MAX)).unwrap();
        assert!(issued.not_after > OffsetDateTime::now_utc() + time::Duration::days(3000));
    }

    #[test]
    fn rejects_foreign_trust_domain() {
        let ca = CertificateAuthority::generate("cluster.local").unwrap();
        let (csr, _key) = workload::generate_csr(&identity("reviews", "evil.corp")).unwrap();
        assert!(matches!(
            ca.sign(&csr, "", Duration::ZERO),
            Err(PkiError::ForeignIdentity { .. })
        ));
    }

    #[test]
    fn requires_bootstrap_token() {
        let ca = CertificateAuthority::generate("cluster.local")
            .unwrap()
            .with_bootstrap_token("s3cret");
        let (csr, _key) = workload::generate_csr(&identity("reviews", "cluster.local")).unwrap();

        assert!(matches!(
            ca.sign(&csr, "guess", Duration::ZERO),
            Err(PkiError::InvalidToken)
        ));
        assert!(ca.sign(&csr, "s3cret", Duration::ZERO).is_ok());
    }

    #[test]
    fn rejects_csr_without_single_identity() {
        let ca = CertificateAuthority::generate("cluster.local").unwrap();

        let params = CertificateParams::new(vec![
            "a.default.serviceaccount.identity.cluster.local".into(),
            "b.default.serviceaccount.identity.cluster.local".into(),
        ]);
        let csr = Certificate::from_params(params)
            .unwrap()
            .serialize_request_pem()
            .unwrap();
        assert!(matches!(
            ca.sign(&csr, "", Duration::ZERO),
            Err(PkiError::InvalidCsr(_))
        ));

        let params = CertificateParams::new(vec!["reviews.example.com".into()]);
        let csr = Certificate::from_params(params)
            .unwrap()
            .serialize_request_pem()
            .unwrap();
        assert!(matches!(
            ca.sign(&csr, "", Duration::ZERO),
            Err(PkiError::Identity(_))
        ));

        assert!(matches!(
            ca.sign("garbage", "", Duration::ZERO),
            Err(PkiError::InvalidCsr(_))
        ));
    }

    #[test]
    fn reload_from_pem() {
        let ca = CertificateAuthority::generate("cluster.local").unwrap();
        let reloaded =
            CertificateAuthority::from_pem(ca.trust_bundle_pem(), &ca.root_key_pem(), "cluster.local")
                .unwrap();
        assert_eq!(ca.trust_bundle_pem(), reloaded.trust_bundle_pem());

        let (csr, key) = workload::generate_csr(&identity("reviews", "cluster.local")).unwrap();
        let issued = reloaded.sign(&csr, "", Duration::ZERO).unwrap();
        let certificate = WorkloadCertificate::new(
            issued.identity,
            key,
            issued.chain_pem,
            ca.trust_bundle_pem().into(),
        )
        .unwrap();
        assert!(!certificate.needs_rotation());
    }
}

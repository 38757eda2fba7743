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

use std::time::Duration;

use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType};
use time::OffsetDateTime;

use super::{certificates, proto, tls, PkiError};
use crate::mesh::Identity;

/// Fraction of a certificate's lifetime after which it is replaced.
pub const ROTATION_THRESHOLD: f64 = 0.8;

/// Generates a fresh ECDSA P-256 key and a CSR requesting `identity`,
/// returning both PEM encoded as `(csr, key)`.
pub fn generate_csr(identity: &Identity) -> Result<(String, String), PkiError> {
    let mut params = CertificateParams::new(vec![identity.to_string()]);
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, identity.to_string());
    params.distinguished_name = name;

    let request = Certificate::from_params(params)?;
    Ok((
        request.serialize_request_pem()?,
        request.serialize_private_key_pem(),
    ))
}

/// A workload's key together with the certificate chain issued for it.
#[derive(Clone)]
pub struct WorkloadCertificate {
    identity: Identity,
    key_pem: String,
    chain_pem: String,
    trust_bundle_pem: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl WorkloadCertificate {
    /// Checks the chain was issued for `identity` and reads its validity.
    pub fn new(
        identity: Identity,
        key_pem: String,
        chain_pem: String,
        trust_bundle_pem: String,
    ) -> Result<Self, PkiError> {
        let leaf = certificates(&chain_pem)?.remove(0);
        certificates(&trust_bundle_pem)?;

        let issued_for = tls::identity_from_der(&leaf.0)?;
        if issued_for != identity {
            return Err(PkiError::IdentityMismatch {
                expected: identity.to_string(),
                found: issued_for.to_string(),
            });
        }

        let (_, certificate) = x509_parser::parse_x509_certificate(&leaf.0)
            .map_err(|error| PkiError::Parse(error.to_string()))?;
        let validity = certificate.validity();

        Ok(Self {
            identity,
            key_pem,
            chain_pem,
            trust_bundle_pem,
            not_before: validity.not_before.to_datetime(),
            not_after: validity.not_after.to_datetime(),
        })
    }

    pub fn from_response(
        identity: Identity,
        key_pem: String,
        response: proto::CertificateResponse,
    ) -> Result<Self, PkiError> {
        Self::new(identity, key_pem, response.cert_chain, response.trust_bundle)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn chain_pem(&self) -> &str {
        &self.chain_pem
    }

    pub fn trust_bundle_pem(&self) -> &str {
        &self.trust_bundle_pem
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn lifetime(&self) -> Duration {
        to_std(self.not_after - self.not_before)
    }

    /// Time left until the certificate expires, zero once it has.
    pub fn remaining(&self) -> Duration {
        to_std(self.not_after - OffsetDateTime::now_utc())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// The point after which the certificate should be replaced.
    pub fn rotation_time(&self) -> OffsetDateTime {
        self.not_before + (self.not_after - self.not_before) * ROTATION_THRESHOLD
    }

    pub fn until_rotation(&self) -> Duration {
        to_std(self.rotation_time() - OffsetDateTime::now_utc())
    }

    pub fn needs_rotation(&self) -> bool {
        self.until_rotation().is_zero()
    }
}

impl std::fmt::Debug for WorkloadCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadCertificate")
            .field("identity", &self.identity.to_string())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Negative durations saturate at zero.
fn to_std(duration: time::Duration) -> Duration {
    Duration::try_from(duration).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::CertificateAuthority;

    #[test]
    fn rotation_point_is_past_most_of_the_lifetime() {
        let ca = CertificateAuthority::generate("cluster.local").unwrap();
        let identity: Identity = "reviews.default.serviceaccount.identity.cluster.local"
            .parse()
            .unwrap();
        let (csr, key) = generate_csr(&identity).unwrap();
        let issued = ca.sign(&csr, "", Duration::from_secs(3600)).unwrap();
        let certificate =
            WorkloadCertificate::new(identity, key, issued.chain_pem, ca.trust_bundle_pem().into())
                .unwrap();

        // The lifetime includes the backdated clock skew allowance.
        assert_eq!(Duration::from_secs(3660), certificate.lifetime());
        assert!(!certificate.is_expired());
        assert!(!certificate.needs_rotation());
        let until_rotation = certificate.until_rotation();
        assert!(until_rotation > Duration::from_secs(2800));
        assert!(until_rotation < certificate.remaining());
    }

    #[test]
    fn rejects_certificate_for_other_identity() {
        let ca = CertificateAuthority::generate("cluster.local").unwrap();
        let reviews: Identity = "reviews.default.serviceaccount.identity.cluster.local"
            .parse()
            .unwrap();
        let ratings: Identity = "ratings.default.serviceaccount.identity.cluster.local"
            .parse()
            .unwrap();

        let (csr, key) = generate_csr(&reviews).unwrap();
        let issued = ca.sign(&csr, "", Duration::ZERO).unwrap();
        assert!(matches!(
            WorkloadCertificate::new(ratings, key, issued.chain_pem, ca.trust_bundle_pem().into()),
            Err(PkiError::IdentityMismatch { .. })
        ));
    }
}

//! Mock certificates
//!
//! 🎭 Self-signed stand-ins served when no real certificate can be obtained.
//! The subject carries the failure reason so it shows up in the browser's
//! certificate viewer.

use crate::cert_store::{CertStoreError, CertificateOrigin, CertificateResource};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;

/// Mock validity. Certificates are renewed inside the last 7 days, so a
/// mock is first reconsidered after 6 hours.
pub const MOCK_VALIDITY: time::Duration = time::Duration::hours(7 * 24 + 6);

const MOCK_ORGANIZATION: &str = "Pages Error Certificate (couldn't obtain ACME certificate)";

/// Mock generation errors
#[derive(Debug, Error)]
pub enum MockError {
    #[error("🔧 Certificate generation error: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("⚠️ Invalid mock certificate: {0}")]
    Invalid(#[from] CertStoreError),
}

/// Build a mock certificate for `domain` carrying `message`.
pub fn mock_certificate(domain: &str, message: &str) -> Result<CertificateResource, MockError> {
    let mut params = CertificateParams::new(vec![domain.to_string()])?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    dn.push(DnType::OrganizationName, MOCK_ORGANIZATION);
    // rcgen keeps one value per attribute type, so the notes share one OU
    dn.push(
        DnType::OrganizationalUnitName,
        format!(
            "Will not try again for 6 hours to avoid hitting rate limits for your domain. \
             Check the DNS records of your domain and the gateway documentation for troubleshooting tips. \
             Error message: {}",
            message
        ),
    );
    params.distinguished_name = dn;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + MOCK_VALIDITY;

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let resource = CertificateResource::from_pem(
        domain,
        cert.pem(),
        key_pair.serialize_pem(),
        CertificateOrigin::Mock,
    )?;

    tracing::warn!("🎭 Generated mock certificate for {}: {}", domain, message);
    Ok(resource)
}

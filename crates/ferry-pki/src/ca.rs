//! Self-signed CA creation and certificate inspection

use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, KeyPair,
    KeyUsagePurpose,
};
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::fetcher::MemCertFetcher;
use crate::{parse_pem, PkiError, Result};

/// Compute `(now, now + duration)` for certificate generation
pub(crate) fn compute_validity(
    duration: Duration,
) -> Result<(::time::OffsetDateTime, ::time::OffsetDateTime)> {
    let now = ::time::OffsetDateTime::now_utc();
    let lifetime = ::time::Duration::try_from(duration).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("invalid validity duration: {}", e))
    })?;
    let not_after = now.checked_add(lifetime).ok_or_else(|| {
        PkiError::CertificateGenerationFailed("validity duration overflows".to_string())
    })?;
    Ok((now, not_after))
}

/// A CA certificate and its private key, both PEM
#[derive(Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: Zeroizing<String>,
}

impl CertificateAuthority {
    /// Create a new self-signed CA valid for `validity` from now
    pub fn new_self_signed(common_name: &str, validity: Duration) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(validity)?;
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
        })
    }

    /// CA certificate, PEM
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// CA private key, PKCS#8 PEM
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// A fetcher serving this CA's certificate and key
    pub fn mem_fetcher(&self) -> MemCertFetcher {
        MemCertFetcher::new(self.cert_pem.as_bytes(), self.key_pem.as_bytes())
    }
}

/// Fields of a parsed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject common name
    pub common_name: String,
    /// Subject organization values, in order
    pub organizations: Vec<String>,
    /// DNS subject alternative names, in order
    pub dns_names: Vec<String>,
    /// Start of validity (Unix timestamp)
    pub not_before: i64,
    /// End of validity (Unix timestamp)
    pub not_after: i64,
}

impl CertificateInfo {
    /// Parse the first certificate of a PEM document
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let organizations = cert
            .subject()
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect();

        let dns_names = cert
            .subject_alternative_name()
            .map_err(|e| PkiError::ParseError(format!("failed to parse SAN extension: {}", e)))?
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(dns.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            common_name,
            organizations,
            dns_names,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
        })
    }

    /// Total lifetime in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CertFetcher;

    #[test]
    fn self_signed_ca_has_requested_subject_and_validity() {
        let ca = CertificateAuthority::new_self_signed("ferry-test-ca", Duration::from_secs(3600))
            .unwrap();

        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem().contains("BEGIN PRIVATE KEY"));

        let info = CertificateInfo::from_pem(ca.cert_pem()).unwrap();
        assert_eq!(info.common_name, "ferry-test-ca");
        assert!(info.organizations.is_empty());
        assert!(info.dns_names.is_empty());
        assert_eq!(info.lifetime_secs(), 3600);
    }

    #[tokio::test]
    async fn mem_fetcher_serves_ca_material() {
        let ca = CertificateAuthority::new_self_signed("ferry-test-ca", Duration::from_secs(60))
            .unwrap();
        let fetcher = ca.mem_fetcher();

        assert_eq!(fetcher.cert_bytes().await.unwrap(), ca.cert_pem().as_bytes());
        assert_eq!(
            fetcher.key_bytes().await.unwrap().as_slice(),
            ca.key_pem().as_bytes()
        );
    }

    #[test]
    fn validity_overflow_is_rejected() {
        assert!(matches!(
            compute_validity(Duration::from_secs(u64::MAX)),
            Err(PkiError::CertificateGenerationFailed(_))
        ));
    }

    #[test]
    fn info_rejects_non_certificate_pem() {
        let pem = "-----BEGIN CERTIFICATE-----\naGVsbG8=\n-----END CERTIFICATE-----\n";
        assert!(matches!(
            CertificateInfo::from_pem(pem),
            Err(PkiError::ParseError(_))
        ));
    }
}

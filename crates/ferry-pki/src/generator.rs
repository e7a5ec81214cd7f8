//! Client and server certificate minting from a fetched CA
//!
//! [`FetchCertGenerator`] pulls the CA certificate and key from its
//! [`CertFetcher`] on every call, checks that they belong together, and signs
//! a fresh leaf with a newly generated key.
//!
//! rcgen keeps a single value per subject attribute type, so client
//! certificates get their subject written here, one organization RDN per
//! group, and the TBS certificate is signed again with the CA key.

use std::time::Duration;

use async_trait::async_trait;
use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
    SigningKey,
};
use tracing::debug;
use x509_parser::prelude::*;
use yasna::models::ObjectIdentifier;
use zeroize::Zeroizing;

use crate::ca::compute_validity;
use crate::fetcher::CertFetcher;
use crate::{parse_pem, PkiError, Result};

/// A freshly minted certificate and its private key
#[derive(Clone)]
pub struct GeneratedCertificate {
    /// Leaf certificate, PEM
    pub cert_pem: String,
    /// Leaf private key, PKCS#8 PEM
    pub key_pem: Zeroizing<String>,
}

impl std::fmt::Debug for GeneratedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedCertificate")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Mints short-lived client and server certificates
#[async_trait]
pub trait CertGenerator: Send + Sync {
    /// Client certificate for identity `name` carrying `groups`
    async fn make_client_cert(
        &self,
        name: &str,
        groups: &[String],
        duration: Duration,
    ) -> Result<GeneratedCertificate>;

    /// Server certificate for `service` in `namespace`
    async fn make_server_cert(
        &self,
        namespace: &str,
        service: &str,
        duration: Duration,
    ) -> Result<GeneratedCertificate>;
}

/// DNS names a service answers to inside the cluster
pub fn service_to_hostnames(namespace: &str, service: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{}.{}", service, namespace),
        format!("{}.{}.svc", service, namespace),
    ]
}

/// [`CertGenerator`] signing with a CA read through a [`CertFetcher`]
pub struct FetchCertGenerator<F> {
    fetcher: F,
}

impl<F: CertFetcher> FetchCertGenerator<F> {
    /// Sign with the CA `fetcher` yields
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    async fn load_ca(&self) -> Result<(String, KeyPair)> {
        let cert_bytes = self.fetcher.cert_bytes().await?;
        let key_bytes = self.fetcher.key_bytes().await?;

        let cert_pem = String::from_utf8(cert_bytes)
            .map_err(|_| PkiError::InvalidCa("CA certificate is not valid UTF-8".to_string()))?;
        let key_pem = std::str::from_utf8(&key_bytes)
            .map_err(|_| PkiError::InvalidCa("CA key is not valid UTF-8".to_string()))?;

        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::InvalidCa(format!("failed to parse CA key: {}", e)))?;

        let der = parse_pem(&cert_pem)
            .map_err(|e| PkiError::InvalidCa(format!("failed to parse CA certificate: {}", e)))?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::InvalidCa(format!("failed to parse CA certificate: {}", e)))?;

        if cert.public_key().subject_public_key.data.as_ref() != key.der_bytes() {
            return Err(PkiError::InvalidCa(
                "CA key does not match CA certificate".to_string(),
            ));
        }

        Ok((cert_pem, key))
    }

    /// Sign `params`, replacing the encoded subject with `subject` when given
    async fn sign(
        &self,
        mut params: CertificateParams,
        subject: Option<Vec<u8>>,
    ) -> Result<GeneratedCertificate> {
        let (ca_cert_pem, ca_key) = self.load_ca().await?;
        let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::InvalidCa(format!("failed to create issuer: {}", e)))?;

        params.is_ca = IsCa::NoCa;

        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate leaf key: {}", e))
        })?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        let cert_pem = match subject {
            Some(subject) => {
                let der = resign_with_subject(cert.der().as_ref(), &subject, &ca_key)?;
                ::pem::encode_config(
                    &::pem::Pem::new("CERTIFICATE", der),
                    ::pem::EncodeConfig::new().set_line_ending(::pem::LineEnding::LF),
                )
            }
            None => cert.pem(),
        };

        Ok(GeneratedCertificate {
            cert_pem,
            key_pem: Zeroizing::new(leaf_key.serialize_pem()),
        })
    }
}

const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];
const OID_ORGANIZATION: &[u64] = &[2, 5, 4, 10];

/// DER `Name` with one organization RDN per group followed by the common name
fn client_subject(name: &str, groups: &[String]) -> Vec<u8> {
    let attributes = groups
        .iter()
        .map(|group| (OID_ORGANIZATION, group.as_str()))
        .chain(std::iter::once((OID_COMMON_NAME, name)));

    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            for (oid, value) in attributes {
                writer.next().write_set(|writer| {
                    writer.next().write_sequence(|writer| {
                        writer.next().write_oid(&ObjectIdentifier::from_slice(oid));
                        writer.next().write_utf8_string(value);
                    });
                });
            }
        });
    })
}

/// Swap the subject of `cert_der` for `subject` and sign the result with `ca_key`
fn resign_with_subject(cert_der: &[u8], subject: &[u8], ca_key: &KeyPair) -> Result<Vec<u8>> {
    let encoding = |e: yasna::ASN1Error| {
        PkiError::CertificateGenerationFailed(format!("failed to re-encode certificate: {}", e))
    };

    let outer = yasna::parse_der(cert_der, |reader| {
        reader.collect_sequence_of(|reader| reader.read_der())
    })
    .map_err(encoding)?;
    let [tbs, algorithm, _] = outer.as_slice() else {
        return Err(PkiError::CertificateGenerationFailed(format!(
            "expected 3 certificate fields, found {}",
            outer.len()
        )));
    };

    let mut fields = yasna::parse_der(tbs, |reader| {
        reader.collect_sequence_of(|reader| reader.read_der())
    })
    .map_err(encoding)?;

    // version [0], serialNumber, signature, issuer, validity, subject
    let has_version = fields.first().and_then(|field| field.first()) == Some(&0xa0);
    let subject_index = if has_version { 5 } else { 4 };
    let slot = fields.get_mut(subject_index).ok_or_else(|| {
        PkiError::CertificateGenerationFailed("certificate has no subject field".to_string())
    })?;
    *slot = subject.to_vec();

    let tbs = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            for field in &fields {
                writer.next().write_der(field);
            }
        });
    });

    let signature = ca_key.sign(&tbs).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
    })?;

    Ok(yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_der(&tbs);
            writer.next().write_der(algorithm);
            writer
                .next()
                .write_bitvec_bytes(&signature, signature.len() * 8);
        });
    }))
}

#[async_trait]
impl<F: CertFetcher> CertGenerator for FetchCertGenerator<F> {
    async fn make_client_cert(
        &self,
        name: &str,
        groups: &[String],
        duration: Duration,
    ) -> Result<GeneratedCertificate> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(name.to_string()));
        params.distinguished_name = dn;

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let (not_before, not_after) = compute_validity(duration)?;
        params.not_before = not_before;
        params.not_after = not_after;

        debug!(name, groups = ?groups, "Signing client certificate");
        let subject = (!groups.is_empty()).then(|| client_subject(name, groups));
        self.sign(params, subject).await
    }

    async fn make_server_cert(
        &self,
        namespace: &str,
        service: &str,
        duration: Duration,
    ) -> Result<GeneratedCertificate> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(service.to_string()));
        params.distinguished_name = dn;

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let (not_before, not_after) = compute_validity(duration)?;
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = service_to_hostnames(namespace, service)
            .into_iter()
            .map(|host| {
                Ia5String::try_from(host.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGenerationFailed(format!(
                            "invalid DNS name '{}': {}",
                            host, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(namespace, service, "Signing server certificate");
        self.sign(params, None).await
    }
}

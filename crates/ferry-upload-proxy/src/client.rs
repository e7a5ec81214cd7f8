//! Backend HTTP client with mutual TLS
//!
//! Upload servers only accept connections presenting a client certificate
//! signed by their CA, and present certificates signed by a separate signer
//! whose bundle is published in a config map. The client trusts that bundle
//! and nothing else.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::tls::Version;
use reqwest::{Certificate, Client, Identity};
use tracing::info;
use zeroize::Zeroizing;

use ferry_pki::{CertBundleFetcher, CertFetcher};

use crate::error::{Error, Result};

/// Builds the client used to reach upload servers
#[async_trait]
pub trait ClientCreator: Send + Sync {
    /// Build a new client
    async fn create_client(&self) -> Result<Client>;
}

/// [`ClientCreator`] presenting a fetched identity and trusting a fetched bundle
pub struct MtlsClientCreator<C, B> {
    cert_fetcher: C,
    bundle_fetcher: B,
    timeout: Duration,
}

impl<C, B> MtlsClientCreator<C, B>
where
    C: CertFetcher,
    B: CertBundleFetcher,
{
    /// Present `cert_fetcher`'s identity, trust `bundle_fetcher`'s CAs, and
    /// abort requests after `timeout`
    pub fn new(cert_fetcher: C, bundle_fetcher: B, timeout: Duration) -> Self {
        Self {
            cert_fetcher,
            bundle_fetcher,
            timeout,
        }
    }
}

#[async_trait]
impl<C, B> ClientCreator for MtlsClientCreator<C, B>
where
    C: CertFetcher,
    B: CertBundleFetcher,
{
    async fn create_client(&self) -> Result<Client> {
        let cert = self.cert_fetcher.cert_bytes().await?;
        let key = self.cert_fetcher.key_bytes().await?;
        let bundle = self.bundle_fetcher.bundle_bytes().await?;

        let mut identity_pem = Zeroizing::new(Vec::with_capacity(cert.len() + key.len() + 1));
        identity_pem.extend_from_slice(&key);
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(&cert);

        let identity = Identity::from_pem(&identity_pem)
            .map_err(|e| Error::Config(format!("invalid client certificate: {}", e)))?;

        let roots = Certificate::from_pem_bundle(&bundle)
            .map_err(|e| Error::Config(format!("invalid upload server CA bundle: {}", e)))?;
        if roots.is_empty() {
            return Err(Error::Config(
                "upload server CA bundle contains no certificates".to_string(),
            ));
        }

        let root_count = roots.len();
        let builder = roots.into_iter().fold(
            Client::builder()
                .use_rustls_tls()
                .tls_built_in_root_certs(false)
                .min_tls_version(Version::TLS_1_2)
                .identity(identity)
                .timeout(self.timeout),
            |builder, root| builder.add_root_certificate(root),
        );

        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build upload client: {}", e)))?;

        info!(roots = root_count, timeout = ?self.timeout, "Built upload server client");
        Ok(client)
    }
}

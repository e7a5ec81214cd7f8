//! Trust material sources
//!
//! [`CertFetcher`] yields a certificate/key pair, [`CertBundleFetcher`] a
//! concatenated PEM CA bundle. Each call performs exactly one read and
//! returns the underlying error wrapped with the file or object it came from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use tracing::trace;
use zeroize::Zeroizing;

use ferry_common::{BASE_CERT_PATH, CA_BUNDLE_KEY, TLS_CERT_FILE, TLS_KEY_FILE};

use crate::{PkiError, Result};

/// Source of a certificate and its private key
#[async_trait]
pub trait CertFetcher: Send + Sync {
    /// PEM-encoded private key
    async fn key_bytes(&self) -> Result<Zeroizing<Vec<u8>>>;

    /// PEM-encoded certificate (may include intermediates)
    async fn cert_bytes(&self) -> Result<Vec<u8>>;
}

/// Source of a CA bundle used to verify peers
#[async_trait]
pub trait CertBundleFetcher: Send + Sync {
    /// Concatenated PEM certificates
    async fn bundle_bytes(&self) -> Result<Vec<u8>>;
}

/// Reads `tls.crt` and `tls.key` from a directory
#[derive(Clone, Debug)]
pub struct FileCertFetcher {
    dir: PathBuf,
}

impl FileCertFetcher {
    /// Fetch from an explicit directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Fetch from `/var/run/certs/<name>`, where secrets are mounted
    pub fn named(name: &str) -> Self {
        Self::new(Path::new(BASE_CERT_PATH).join(name))
    }

    /// Directory being read
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read(&self, file: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(file);
        trace!(path = %path.display(), "Reading trust material");
        tokio::fs::read(&path)
            .await
            .map_err(|source| PkiError::Read { path, source })
    }
}

#[async_trait]
impl CertFetcher for FileCertFetcher {
    async fn key_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        self.read(TLS_KEY_FILE).await.map(Zeroizing::new)
    }

    async fn cert_bytes(&self) -> Result<Vec<u8>> {
        self.read(TLS_CERT_FILE).await
    }
}

/// Returns pre-supplied certificate and key bytes
#[derive(Clone)]
pub struct MemCertFetcher {
    cert: Vec<u8>,
    key: Zeroizing<Vec<u8>>,
}

impl MemCertFetcher {
    /// Serve the given certificate and key
    pub fn new(cert: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            cert: cert.into(),
            key: Zeroizing::new(key.into()),
        }
    }
}

#[async_trait]
impl CertFetcher for MemCertFetcher {
    async fn key_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(self.key.clone())
    }

    async fn cert_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.cert.clone())
    }
}

/// Reads the `ca-bundle.crt` field of a named config map
#[derive(Clone)]
pub struct ConfigMapCertBundleFetcher {
    api: Api<ConfigMap>,
    name: String,
}

impl ConfigMapCertBundleFetcher {
    /// Fetch from config map `name` through `api`
    pub fn new(api: Api<ConfigMap>, name: impl Into<String>) -> Self {
        Self {
            api,
            name: name.into(),
        }
    }
}

#[async_trait]
impl CertBundleFetcher for ConfigMapCertBundleFetcher {
    async fn bundle_bytes(&self) -> Result<Vec<u8>> {
        let cm = self.api.get(&self.name).await.map_err(|source| PkiError::Kube {
            name: self.name.clone(),
            source,
        })?;

        bundle_from_config_map(&self.name, cm)
    }
}

fn bundle_from_config_map(name: &str, cm: ConfigMap) -> Result<Vec<u8>> {
    cm.data
        .and_then(|mut data| data.remove(CA_BUNDLE_KEY))
        .map(String::into_bytes)
        .ok_or_else(|| PkiError::BundleMissing {
            name: name.to_string(),
        })
}

/// Returns a pre-supplied bundle
#[derive(Clone, Debug)]
pub struct MemCertBundleFetcher {
    bundle: Vec<u8>,
}

impl MemCertBundleFetcher {
    /// Serve the given bundle
    pub fn new(bundle: impl Into<Vec<u8>>) -> Self {
        Self {
            bundle: bundle.into(),
        }
    }
}

#[async_trait]
impl CertBundleFetcher for MemCertBundleFetcher {
    async fn bundle_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.bundle.clone())
    }
}

//! PKI for Ferry mTLS
//!
//! Where trust material comes from ([`fetcher`]), how short-lived client and
//! server certificates are minted from a fetched CA ([`generator`]), and
//! helpers for creating and inspecting certificates ([`ca`]).
//!
//! Nothing in this crate caches. Every call performs its reads fresh, so
//! rotation of the underlying files or config maps is picked up by the next
//! call without any invalidation protocol.

#![deny(missing_docs)]

pub mod ca;
pub mod fetcher;
pub mod generator;

use std::path::PathBuf;

use thiserror::Error;

pub use ca::{CertificateAuthority, CertificateInfo};
pub use fetcher::{
    CertBundleFetcher, CertFetcher, ConfigMapCertBundleFetcher, FileCertFetcher,
    MemCertBundleFetcher, MemCertFetcher,
};
pub use generator::{CertGenerator, FetchCertGenerator, GeneratedCertificate};

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Reading trust material from disk failed
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// File that could not be read
        path: PathBuf,
        /// The underlying I/O error
        source: std::io::Error,
    },

    /// Reading a bundle object from the cluster failed
    #[error("failed to get config map {name}: {source}")]
    Kube {
        /// Name of the config map
        name: String,
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// The bundle object exists but lacks the bundle field
    #[error("CA bundle missing from config map {name}")]
    BundleMissing {
        /// Name of the config map
        name: String,
    },

    /// CA certificate and key do not form a usable signing pair
    #[error("invalid CA: {0}")]
    InvalidCa(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pem_rejects_garbage() {
        match parse_pem("this is not valid PEM data at all") {
            Err(PkiError::ParseError(msg)) => assert!(msg.contains("parse PEM")),
            other => panic!("expected ParseError, got {other:?}"),
        }
    }

    #[test]
    fn read_error_names_the_file() {
        let err = PkiError::Read {
            path: PathBuf::from("/var/run/certs/client/tls.key"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/var/run/certs/client/tls.key"));
        assert!(msg.contains("no such file"));
    }
}

//! Command line and environment configuration

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};
use crate::readiness::ReadinessPolicy;

/// Ferry upload proxy
#[derive(Parser, Debug, Clone)]
#[command(name = "ferry-upload-proxy", version, about, long_about = None)]
pub struct ProxyArgs {
    /// Address to listen on
    #[arg(long, env = "FERRY_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// Port to listen on
    #[arg(long, env = "FERRY_PORT", default_value_t = 8443)]
    pub port: u16,

    /// TLS certificate for the listener; plaintext when unset
    #[arg(long, env = "FERRY_SERVER_CERT_FILE", requires = "server_key_file")]
    pub server_cert_file: Option<PathBuf>,

    /// TLS private key for the listener
    #[arg(long, env = "FERRY_SERVER_KEY_FILE", requires = "server_cert_file")]
    pub server_key_file: Option<PathBuf>,

    /// Directory holding tls.crt and tls.key presented to upload servers
    #[arg(
        long,
        env = "FERRY_CLIENT_CERT_DIR",
        default_value = "/var/run/certs/ferry-uploadserver-client"
    )]
    pub client_cert_dir: PathBuf,

    /// Config map holding the upload server CA bundle
    #[arg(
        long,
        env = "FERRY_SERVER_CA_BUNDLE",
        default_value = "ferry-uploadserver-signer-bundle"
    )]
    pub server_ca_bundle: String,

    /// Namespace of the CA bundle config map
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: String,

    /// PEM public key that upload tokens are signed with
    #[arg(
        long,
        env = "APISERVER_PUBLIC_KEY",
        conflicts_with = "apiserver_public_key_file",
        required_unless_present = "apiserver_public_key_file"
    )]
    pub apiserver_public_key: Option<String>,

    /// File holding the PEM public key that upload tokens are signed with
    #[arg(long, env = "APISERVER_PUBLIC_KEY_FILE")]
    pub apiserver_public_key_file: Option<PathBuf>,

    /// Seconds between upload target readiness checks
    #[arg(long, env = "FERRY_POLL_INTERVAL_SECS", default_value_t = 1)]
    pub poll_interval_secs: u64,

    /// Seconds to wait for an upload target to become ready
    #[arg(long, env = "FERRY_POLL_TIMEOUT_SECS", default_value_t = 10)]
    pub poll_timeout_secs: u64,

    /// Seconds before a proxied upload is aborted
    #[arg(long, env = "FERRY_REQUEST_TIMEOUT_SECS", default_value_t = 86400)]
    pub request_timeout_secs: u64,

    /// Kubeconfig to use instead of in-cluster configuration
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Log JSON lines instead of text
    #[arg(long, env = "FERRY_LOG_JSON", default_value_t = true, action = clap::ArgAction::Set)]
    pub log_json: bool,
}

/// Certificate and key files for the listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    /// PEM certificate chain
    pub cert: PathBuf,
    /// PEM private key
    pub key: PathBuf,
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// Serve TLS with these files, plaintext when `None`
    pub tls: Option<TlsFiles>,
}

/// Where the token verification key comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeySource {
    /// PEM text
    Inline(String),
    /// PEM file
    File(PathBuf),
}

impl PublicKeySource {
    /// The PEM text
    pub async fn read(&self) -> Result<String> {
        match self {
            PublicKeySource::Inline(pem) => Ok(pem.clone()),
            PublicKeySource::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::Config(format!(
                    "failed to read public key {}: {}",
                    path.display(),
                    e
                ))
            }),
        }
    }
}

/// Validated proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listener
    pub server: ServerConfig,
    /// Directory with the client identity for upload servers
    pub client_cert_dir: PathBuf,
    /// Config map holding the upload server CA bundle
    pub server_ca_bundle: String,
    /// Namespace of the CA bundle config map
    pub namespace: String,
    /// Token verification key
    pub apiserver_public_key: PublicKeySource,
    /// Readiness polling
    pub readiness: ReadinessPolicy,
    /// Upper bound on a proxied upload
    pub request_timeout: Duration,
    /// Kubeconfig override
    pub kubeconfig: Option<PathBuf>,
}

impl TryFrom<ProxyArgs> for ProxyConfig {
    type Error = Error;

    fn try_from(args: ProxyArgs) -> Result<Self> {
        let tls = match (args.server_cert_file, args.server_key_file) {
            (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "--server-cert-file and --server-key-file must be set together".to_string(),
                ))
            }
        };

        let apiserver_public_key = match (args.apiserver_public_key, args.apiserver_public_key_file)
        {
            (Some(pem), None) => PublicKeySource::Inline(pem),
            (None, Some(path)) => PublicKeySource::File(path),
            _ => {
                return Err(Error::Config(
                    "exactly one of --apiserver-public-key and --apiserver-public-key-file is required"
                        .to_string(),
                ))
            }
        };

        if args.namespace.is_empty() {
            return Err(Error::Config("--namespace must not be empty".to_string()));
        }
        if args.poll_interval_secs == 0 {
            return Err(Error::Config(
                "--poll-interval-secs must be positive".to_string(),
            ));
        }

        Ok(Self {
            server: ServerConfig {
                addr: SocketAddr::new(args.bind_address, args.port),
                tls,
            },
            client_cert_dir: args.client_cert_dir,
            server_ca_bundle: args.server_ca_bundle,
            namespace: args.namespace,
            apiserver_public_key,
            readiness: ReadinessPolicy {
                poll_interval: Duration::from_secs(args.poll_interval_secs),
                timeout: Duration::from_secs(args.poll_timeout_secs),
            },
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            kubeconfig: args.kubeconfig,
        })
    }
}

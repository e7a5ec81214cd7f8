//! Ferry upload proxy
//!
//! Authenticates upload requests with short-lived tokens, waits for the
//! target claim's upload server to report ready, then streams the request to
//! that server over mutually authenticated TLS and streams the answer back.
//!
//! Each request moves strictly through authentication, token policy,
//! readiness and forwarding; nothing is forwarded before the earlier steps
//! succeed, and no state is kept between requests.

#![deny(missing_docs)]

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod readiness;
pub mod resolver;
pub mod server;

pub use auth::{TokenExtractor, UploadAuthorizer};
pub use client::{ClientCreator, MtlsClientCreator};
pub use config::{ProxyArgs, ProxyConfig, PublicKeySource, ServerConfig, TlsFiles};
pub use error::{Error, Result};
pub use readiness::{
    KubeTargetReader, ReadinessError, ReadinessGate, ReadinessPolicy, TargetLookup, TargetReader,
    TargetState,
};
pub use resolver::{resolve_upload_path, ServiceUrlResolver, UrlResolver};
pub use server::{router, serve, AppState};

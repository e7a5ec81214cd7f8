//! Ferry upload proxy - authenticated streaming proxy for claim uploads

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use tracing::info;

use ferry_auth::{decode_public_key_pem, TokenValidator, DEFAULT_LEEWAY};
use ferry_common::kube_utils::create_client;
use ferry_common::telemetry::{init_telemetry, TelemetryConfig};
use ferry_common::UPLOAD_TOKEN_ISSUER;
use ferry_pki::{ConfigMapCertBundleFetcher, FileCertFetcher};
use ferry_upload_proxy::{
    router, serve, AppState, ClientCreator, KubeTargetReader, MtlsClientCreator, ProxyArgs,
    ProxyConfig, ReadinessGate, ServiceUrlResolver, UploadAuthorizer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // aws-lc-rs backs the TLS listener; nothing can be served without it.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let args = ProxyArgs::parse();

    init_telemetry(TelemetryConfig {
        service_name: "ferry-upload-proxy".to_string(),
        json: args.log_json,
    })?;

    let config = ProxyConfig::try_from(args)?;
    run(config).await
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let client = create_client(config.kubeconfig.as_deref())
        .await
        .context("failed to create kubernetes client")?;

    let public_key_pem = config.apiserver_public_key.read().await?;
    let public_key =
        decode_public_key_pem(&public_key_pem).context("invalid apiserver public key")?;
    let validator = TokenValidator::new(UPLOAD_TOKEN_ISSUER, &public_key, DEFAULT_LEEWAY)?;

    let bundle_fetcher = ConfigMapCertBundleFetcher::new(
        Api::<ConfigMap>::namespaced(client.clone(), &config.namespace),
        config.server_ca_bundle.clone(),
    );
    let upload_client = MtlsClientCreator::new(
        FileCertFetcher::new(&config.client_cert_dir),
        bundle_fetcher,
        config.request_timeout,
    )
    .create_client()
    .await
    .context("failed to build upload server client")?;

    let state = AppState {
        authorizer: Arc::new(UploadAuthorizer::new(validator)?),
        gate: ReadinessGate::new(Arc::new(KubeTargetReader::new(client)), config.readiness),
        resolver: Arc::new(ServiceUrlResolver::default()),
        client: upload_client,
    };

    info!(
        addr = %config.server.addr,
        tls = config.server.tls.is_some(),
        readiness_timeout = ?config.readiness.timeout,
        "Upload proxy configured"
    );

    serve(&config.server, router(state)).await?;
    Ok(())
}

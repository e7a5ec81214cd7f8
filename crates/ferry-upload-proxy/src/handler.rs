//! Upload request handler
//!
//! Runs authentication, readiness and forwarding in order. The request body
//! is streamed to the upload server and the response body is streamed back;
//! neither is buffered in full.

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::Request;
use axum::response::Response;
use futures::TryStreamExt;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::readiness::ReadinessError;
use crate::resolver::resolve_upload_path;
use crate::server::AppState;

/// Authenticate, wait for the target, then proxy the upload
pub async fn upload_handler(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Result<Response<Body>> {
    let payload = state.authorizer.authorize(request.headers())?;

    let target = state
        .gate
        .wait_until_ready(&payload.namespace, &payload.name)
        .await
        .inspect_err(log_readiness_rejection)?;

    let path = resolve_upload_path(&target, request.uri().path()).inspect_err(|e| {
        warn!(error = %e, "Rejecting upload: unsupported content type");
    })?;

    let url = state.resolver.resolve(&target.namespace, &target.name, &path);
    info!(
        namespace = %payload.namespace,
        name = %payload.name,
        target = %target.name,
        url = %url,
        "Proxying upload"
    );

    forward(&state.client, url, request).await
}

fn log_readiness_rejection(err: &ReadinessError) {
    match err {
        ReadinessError::TargetNotFound { namespace, name } => {
            warn!(%namespace, %name, "Rejecting upload: target not found")
        }
        ReadinessError::AlreadyCompleted { namespace, name } => {
            warn!(%namespace, %name, "Rejecting upload: upload already completed")
        }
        ReadinessError::NotUploadTarget { namespace, name } => {
            warn!(%namespace, %name, "Rejecting upload: not an upload target")
        }
        ReadinessError::Timeout { namespace, name, waited } => {
            warn!(%namespace, %name, ?waited, "Rejecting upload: upload server not ready")
        }
        ReadinessError::Store(e) => {
            error!(error = %e, "Rejecting upload: failed to read target")
        }
    }
}

/// Send `request` to `url` and stream the answer back
async fn forward(
    client: &reqwest::Client,
    url: String,
    request: Request<Body>,
) -> Result<Response<Body>> {
    let (parts, body) = request.into_parts();

    let url = match parts.uri.query() {
        Some(query) => format!("{}?{}", url, query),
        None => url,
    };

    let mut builder = client.request(parts.method.clone(), &url);
    for header in [CONTENT_TYPE, CONTENT_LENGTH] {
        if let Some(value) = parts.headers.get(&header) {
            builder = builder.header(header, value.clone());
        }
    }

    let response = builder
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await
        .map_err(|e| {
            error!(error = %e, url = %url, "Upload server request failed");
            Error::Backend(e.to_string())
        })?;

    let status = response.status();
    debug!(status = %status, url = %url, "Upload server responded");

    let mut builder = Response::builder().status(status);
    if let Some(content_type) = response.headers().get(CONTENT_TYPE) {
        builder = builder.header(CONTENT_TYPE, content_type.clone());
    }

    let stream = response.bytes_stream().inspect_err(move |e| {
        warn!(error = %e, url = %url, "Upload server response stream failed");
    });

    builder
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(format!("failed to build response: {}", e)))
}

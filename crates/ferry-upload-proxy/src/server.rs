//! Upload proxy server

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tower_http::cors::CorsLayer;
use tracing::info;

use ferry_common::{HEALTHZ_PATH, PROXY_PATHS};

use crate::auth::UploadAuthorizer;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::handler::upload_handler;
use crate::readiness::ReadinessGate;
use crate::resolver::UrlResolver;

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Token extraction, verification and policy
    pub authorizer: Arc<UploadAuthorizer>,
    /// Upload target readiness
    pub gate: ReadinessGate,
    /// Upload server addressing
    pub resolver: Arc<dyn UrlResolver>,
    /// Client for upload servers, built once at startup
    pub client: reqwest::Client,
}

/// Routes for the health check and every upload path
pub fn router(state: AppState) -> Router {
    let router = PROXY_PATHS
        .iter()
        .fold(Router::new(), |router, path| {
            router.route(path, post(upload_handler).put(upload_handler))
        })
        .route(HEALTHZ_PATH, get(|| async { "OK" }));

    router.layer(CorsLayer::permissive()).with_state(state)
}

/// Serve `app` until the listener fails
///
/// Uses TLS when certificate files are configured, plaintext otherwise.
pub async fn serve(config: &ServerConfig, app: Router) -> Result<()> {
    let result = match &config.tls {
        Some(files) => {
            let tls_config = RustlsConfig::from_pem_file(&files.cert, &files.key)
                .await
                .map_err(|e| Error::Config(format!("TLS config error: {}", e)))?;

            info!(addr = %config.addr, "Starting upload proxy (TLS)");
            axum_server::bind_rustls(config.addr, tls_config)
                .serve(app.into_make_service())
                .await
        }
        None => {
            info!(addr = %config.addr, "Starting upload proxy (plaintext)");
            axum_server::bind(config.addr)
                .serve(app.into_make_service())
                .await
        }
    };

    result.map_err(|e| Error::Internal(format!("server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    use axum::body::{to_bytes, Body, Bytes};
    use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
    use axum::http::{HeaderMap, Method, Request, StatusCode};
    use axum::routing::any;
    use ferry_auth::{Operation, Payload, TokenGenerator, TokenValidator, DEFAULT_LEEWAY};
    use ferry_common::{
        ANN_CONTENT_TYPE, ANN_POD_PHASE, ANN_POD_READY, ANN_UPLOAD_REQUEST, POD_PHASE_SUCCEEDED,
        UPLOAD_TOKEN_ISSUER,
    };
    use futures::StreamExt;
    use rsa::RsaPrivateKey;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::readiness::{MockTargetReader, ReadinessPolicy, TargetLookup, TargetState};

    const NS: &str = "default";
    const PVC: &str = "disk";

    fn signing_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
    }

    fn token(payload: &Payload) -> String {
        TokenGenerator::new(UPLOAD_TOKEN_ISSUER, signing_key(), Duration::from_secs(300))
            .unwrap()
            .generate(payload)
            .unwrap()
    }

    fn upload_token() -> String {
        token(&Payload::upload(NS, PVC))
    }

    /// Sends every upload to a fixed base URL
    struct FixedResolver(String);

    impl UrlResolver for FixedResolver {
        fn resolve(&self, _namespace: &str, _name: &str, path: &str) -> String {
            format!("{}{}", self.0, path)
        }
    }

    fn target(annotations: &[(&str, &str)]) -> TargetLookup {
        TargetLookup::Found(TargetState {
            name: PVC.to_string(),
            namespace: NS.to_string(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        })
    }

    fn ready_target() -> TargetLookup {
        target(&[(ANN_UPLOAD_REQUEST, ""), (ANN_POD_READY, "true")])
    }

    fn app_with(lookup: TargetLookup, backend: &str) -> Router {
        let mut reader = MockTargetReader::new();
        reader
            .expect_get_target()
            .returning(move |_, _| Ok(lookup.clone()));

        let validator = TokenValidator::new(
            UPLOAD_TOKEN_ISSUER,
            &signing_key().to_public_key(),
            DEFAULT_LEEWAY,
        )
        .unwrap();

        router(AppState {
            authorizer: Arc::new(UploadAuthorizer::new(validator).unwrap()),
            gate: ReadinessGate::new(
                Arc::new(reader),
                ReadinessPolicy {
                    poll_interval: Duration::from_millis(10),
                    timeout: Duration::from_millis(50),
                },
            ),
            resolver: Arc::new(FixedResolver(backend.to_string())),
            client: reqwest::Client::new(),
        })
    }

    fn app(lookup: TargetLookup) -> Router {
        app_with(lookup, "http://127.0.0.1:9")
    }

    fn upload(auth: Option<&str>, body: &'static str) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/v1alpha1/upload")
            .header(CONTENT_LENGTH, body.len());
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// What the fake upload server saw
    #[derive(Debug, Clone, Default)]
    struct Received {
        method: String,
        path_and_query: String,
        content_length: Option<String>,
        content_type: Option<String>,
        body: Vec<u8>,
    }

    /// Upload server on an ephemeral port answering `status` with `reply`
    async fn spawn_backend(
        status: StatusCode,
        reply: &'static str,
    ) -> (String, Arc<Mutex<Option<Received>>>) {
        let seen = Arc::new(Mutex::new(None));
        let record = seen.clone();

        let backend = Router::new().route(
            "/{*path}",
            any(move |method: Method, uri: axum::http::Uri, headers: HeaderMap, body: Bytes| {
                let record = record.clone();
                async move {
                    let header = |name: axum::http::HeaderName| {
                        headers
                            .get(name)
                            .and_then(|v: &axum::http::HeaderValue| v.to_str().ok())
                            .map(str::to_string)
                    };
                    *record.lock().unwrap() = Some(Received {
                        method: method.to_string(),
                        path_and_query: uri
                            .path_and_query()
                            .map(|p| p.to_string())
                            .unwrap_or_default(),
                        content_length: header(CONTENT_LENGTH),
                        content_type: header(CONTENT_TYPE),
                        body: body.to_vec(),
                    });
                    (status, [(CONTENT_TYPE, "text/plain")], reply)
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, backend).await.unwrap();
        });

        (format!("http://{}", addr), seen)
    }

    /// Upload server that reports whether each request body arrived whole
    async fn spawn_draining_backend() -> (String, mpsc::UnboundedReceiver<std::result::Result<usize, String>>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let backend = Router::new().route(
            "/{*path}",
            any(move |body: Body| {
                let tx = tx.clone();
                async move {
                    let outcome = to_bytes(body, usize::MAX)
                        .await
                        .map(|bytes| bytes.len())
                        .map_err(|e| e.to_string());
                    let _ = tx.send(outcome);
                    StatusCode::OK
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, backend).await.unwrap();
        });

        (format!("http://{}", addr), rx)
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let response = app(TargetLookup::NotFound)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "OK");
    }

    #[tokio::test]
    async fn missing_authorization_is_bad_request() {
        let response = app(ready_target())
            .oneshot(upload(None, "data"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_bearer_authorization_is_bad_request() {
        let response = app(ready_target())
            .oneshot(upload(Some("Basic dXNlcjpwYXNz"), "data"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn garbage_token_is_unauthorized() {
        let response = app(ready_target())
            .oneshot(upload(Some("Bearer garbage"), "data"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn token_for_another_operation_is_unauthorized() {
        let mut payload = Payload::upload(NS, PVC);
        payload.operation = Operation::Clone;
        let auth = format!("Bearer {}", token(&payload));

        let response = app(ready_target())
            .oneshot(upload(Some(&auth), "data"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_target_is_unavailable() {
        let auth = format!("Bearer {}", upload_token());
        let response = app(TargetLookup::NotFound)
            .oneshot(upload(Some(&auth), "data"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn completed_target_is_bad_request() {
        let auth = format!("Bearer {}", upload_token());
        let completed = target(&[
            (ANN_UPLOAD_REQUEST, ""),
            (ANN_POD_PHASE, POD_PHASE_SUCCEEDED),
        ]);

        let response = app(completed)
            .oneshot(upload(Some(&auth), "data"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn target_that_never_becomes_ready_is_unavailable() {
        let auth = format!("Bearer {}", upload_token());
        let response = app(target(&[(ANN_UPLOAD_REQUEST, ""), (ANN_POD_READY, "false")]))
            .oneshot(upload(Some(&auth), "data"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unsupported_content_type_is_unavailable() {
        let auth = format!("Bearer {}", upload_token());
        let response = app(target(&[
            (ANN_UPLOAD_REQUEST, ""),
            (ANN_POD_READY, "true"),
            (ANN_CONTENT_TYPE, "qcow"),
        ]))
        .oneshot(upload(Some(&auth), "data"))
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ready_upload_is_passed_through_byte_for_byte() {
        let (backend, seen) = spawn_backend(StatusCode::OK, "X").await;
        let auth = format!("Bearer {}", upload_token());

        let response = app_with(ready_target(), &backend)
            .oneshot(upload(Some(&auth), "image-bytes"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "X");

        let received = seen.lock().unwrap().clone().unwrap();
        assert_eq!(received.method, "POST");
        assert_eq!(received.path_and_query, "/v1alpha1/upload");
        assert_eq!(received.content_length.as_deref(), Some("11"));
        assert_eq!(received.body, b"image-bytes");
    }

    #[tokio::test]
    async fn put_query_and_backend_status_are_preserved() {
        let (backend, seen) = spawn_backend(StatusCode::ACCEPTED, "queued").await;
        let auth = format!("Bearer {}", upload_token());
        let archive = target(&[
            (ANN_UPLOAD_REQUEST, ""),
            (ANN_POD_READY, "true"),
            (ANN_CONTENT_TYPE, "archive"),
        ]);

        let request = Request::builder()
            .method(Method::PUT)
            .uri("/v1beta1/upload-async?retry=1")
            .header(AUTHORIZATION, &auth)
            .header(CONTENT_TYPE, "application/x-tar")
            .body(Body::from("tar"))
            .unwrap();

        let response = app_with(archive, &backend).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert_eq!(body_string(response).await, "queued");

        let received = seen.lock().unwrap().clone().unwrap();
        assert_eq!(received.method, "PUT");
        assert_eq!(received.path_and_query, "/v1beta1/upload-archive?retry=1");
        assert_eq!(received.content_type.as_deref(), Some("application/x-tar"));
        assert_eq!(received.body, b"tar");
    }

    #[tokio::test]
    async fn client_abort_mid_upload_aborts_backend_request() {
        let (backend, mut outcomes) = spawn_draining_backend().await;
        let auth = format!("Bearer {}", upload_token());

        // One chunk, then the client connection drops
        let chunks = futures::stream::iter([
            Ok(Bytes::from_static(b"first-chunk")),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "client went away",
            )),
        ])
        .then(|chunk| async move {
            if chunk.is_err() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            chunk
        });

        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1beta1/upload")
            .header(AUTHORIZATION, &auth)
            .body(Body::from_stream(chunks))
            .unwrap();

        let response = app_with(ready_target(), &backend)
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_err(), "backend saw a complete body: {outcome:?}");
    }

    #[tokio::test]
    async fn unreachable_backend_is_server_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let auth = format!("Bearer {}", upload_token());
        let response = app_with(ready_target(), &backend)
            .oneshot(upload(Some(&auth), "data"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn cors_preflight_is_allowed() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/v1beta1/upload")
            .header("origin", "https://console.example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();

        let response = app(ready_target()).oneshot(request).await.unwrap();

        assert!(response.status().is_success());
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn get_on_upload_path_is_not_allowed() {
        let response = app(ready_target())
            .oneshot(
                Request::get("/v1beta1/upload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}

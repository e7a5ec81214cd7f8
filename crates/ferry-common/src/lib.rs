//! Common types for Ferry: constants, errors, and Kubernetes utilities
//!
//! Shared by the PKI, auth, and upload proxy crates. Annotation keys and
//! secret field names live here so every crate agrees on the wire contract
//! with the external reconciliation controllers.

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Target annotations (written by the upload controller, read-only here)
// =============================================================================

/// API group prefix shared by all target annotations
pub const ANN_API_GROUP: &str = "cdi.kubevirt.io";

/// Phase of the backend worker pod serving a target
pub const ANN_POD_PHASE: &str = "cdi.kubevirt.io/storage.pod.phase";

/// Boolean-as-string readiness of the backend worker pod
pub const ANN_POD_READY: &str = "cdi.kubevirt.io/storage.pod.ready";

/// Marks a PersistentVolumeClaim as accepting uploads
pub const ANN_UPLOAD_REQUEST: &str = "cdi.kubevirt.io/storage.upload.target";

/// Content type of the data being uploaded (`kubevirt` or `archive`)
pub const ANN_CONTENT_TYPE: &str = "cdi.kubevirt.io/storage.contentType";

/// Name of the intermediate claim when the upload populator is in use
pub const ANN_PVC_PRIME_NAME: &str = "cdi.kubevirt.io/storage.populator.pvcPrime";

/// Pod phase value that marks a finished upload
pub const POD_PHASE_SUCCEEDED: &str = "Succeeded";

/// Content type for disk images
pub const CONTENT_TYPE_KUBEVIRT: &str = "kubevirt";

/// Content type for tar archives
pub const CONTENT_TYPE_ARCHIVE: &str = "archive";

/// Data source kind used by the upload populator
pub const VOLUME_UPLOAD_SOURCE_KIND: &str = "VolumeUploadSource";

// =============================================================================
// Keystore and trust material
// =============================================================================

/// Label applied to every secret this system creates
pub const COMPONENT_LABEL: &str = "cdi.kubevirt.io";

/// Secret field holding the PEM private key
pub const KEYSTORE_PRIVATE_KEY: &str = "id_rsa";

/// Secret field holding the PEM public key
pub const KEYSTORE_PUBLIC_KEY: &str = "id_rsa.pub";

/// Config map field holding the concatenated CA bundle
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";

/// Directory under which named certificate pairs are mounted
pub const BASE_CERT_PATH: &str = "/var/run/certs";

/// Certificate file name inside a mounted certificate directory
pub const TLS_CERT_FILE: &str = "tls.crt";

/// Key file name inside a mounted certificate directory
pub const TLS_KEY_FILE: &str = "tls.key";

/// Issuer claim of upload tokens minted by the API server
pub const UPLOAD_TOKEN_ISSUER: &str = "cdi-apiserver";

/// Resource name that upload tokens must target
pub const PVC_RESOURCE: &str = "persistentvolumeclaims";

// =============================================================================
// HTTP paths
// =============================================================================

/// Liveness endpoint
pub const HEALTHZ_PATH: &str = "/healthz";

/// Synchronous upload (beta)
pub const UPLOAD_PATH_SYNC: &str = "/v1beta1/upload";

/// Asynchronous upload (beta)
pub const UPLOAD_PATH_ASYNC: &str = "/v1beta1/upload-async";

/// Archive upload (beta)
pub const UPLOAD_ARCHIVE_PATH: &str = "/v1beta1/upload-archive";

/// Archive upload (alpha)
pub const UPLOAD_ARCHIVE_ALPHA_PATH: &str = "/v1alpha1/upload-archive";

/// Every path the upload proxy accepts and forwards
pub const PROXY_PATHS: &[&str] = &[
    "/v1alpha1/upload",
    "/v1alpha1/upload-async",
    "/v1alpha1/upload-form",
    "/v1alpha1/upload-form-async",
    UPLOAD_PATH_SYNC,
    UPLOAD_PATH_ASYNC,
    "/v1beta1/upload-form",
    "/v1beta1/upload-form-async",
];

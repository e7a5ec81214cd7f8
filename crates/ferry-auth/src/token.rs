//! Upload authorization tokens
//!
//! Tokens are RS256 JWTs issued by the API server and checked by the upload
//! proxy. The claims carry the operation being authorized and the exact
//! resource it applies to, so a token for one claim cannot be replayed
//! against another.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use ferry_common::PVC_RESOURCE;

/// Clock skew tolerated when checking `exp` and `nbf`
pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(10);

/// Token errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// Signature does not verify against the public key
    #[error("invalid token signature")]
    InvalidSignature,

    /// `exp` plus leeway is in the past
    #[error("token expired")]
    Expired,

    /// `nbf` minus leeway is in the future
    #[error("token not yet valid")]
    NotYetValid,

    /// `iss` is not the expected issuer
    #[error("invalid token issuer")]
    InvalidIssuer,

    /// Not a decodable JWT, or its claims are missing or mistyped
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Decodes and verifies but does not authorize what it claims to
    #[error("token claims rejected: {0}")]
    MalformedClaims(String),

    /// Key could not be converted for signing or verification
    #[error("invalid token key: {0}")]
    InvalidKey(String),
}

/// What a token authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Upload data into a claim
    Upload,
    /// Clone one claim into another
    Clone,
    /// Populate a claim from a data source
    Populate,
}

/// Kubernetes resource type coordinates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionResource {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource name
    pub resource: String,
}

/// Application claims of a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Authorized operation
    pub operation: Operation,
    /// Target object name
    pub name: String,
    /// Target object namespace
    pub namespace: String,
    /// Target object type
    pub resource: GroupVersionResource,
    /// Operation-specific parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl Payload {
    /// Payload authorizing an upload into claim `namespace/name`
    pub fn upload(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            operation: Operation::Upload,
            name: name.into(),
            namespace: namespace.into(),
            resource: GroupVersionResource {
                group: String::new(),
                version: "v1".to_string(),
                resource: PVC_RESOURCE.to_string(),
            },
            params: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    iat: i64,
    nbf: i64,
    exp: i64,
    #[serde(flatten)]
    payload: Payload,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Signs tokens
pub struct TokenGenerator {
    issuer: String,
    key: EncodingKey,
    lifetime: Duration,
}

impl TokenGenerator {
    /// Sign as `issuer` with `private_key`, tokens valid for `lifetime`
    pub fn new(
        issuer: impl Into<String>,
        private_key: &RsaPrivateKey,
        lifetime: Duration,
    ) -> Result<Self, TokenError> {
        let der = private_key
            .to_pkcs1_der()
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        Ok(Self {
            issuer: issuer.into(),
            key: EncodingKey::from_rsa_der(der.as_bytes()),
            lifetime,
        })
    }

    /// Sign `payload`, valid from now
    pub fn generate(&self, payload: &Payload) -> Result<String, TokenError> {
        self.generate_at(payload, now_unix())
    }

    /// Sign `payload` as if issued at Unix time `now`
    #[instrument(skip(self, payload), fields(name = %payload.name, namespace = %payload.namespace))]
    pub fn generate_at(&self, payload: &Payload, now: i64) -> Result<String, TokenError> {
        let exp = now.saturating_add(self.lifetime.as_secs() as i64);
        let claims = Claims {
            iss: self.issuer.clone(),
            iat: now,
            nbf: now,
            exp,
            payload: payload.clone(),
        };

        let token = encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| TokenError::Malformed(format!("failed to encode token: {}", e)))?;

        debug!(exp, "Generated token");
        Ok(token)
    }
}

/// Verifies tokens
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
    leeway: i64,
}

impl TokenValidator {
    /// Accept tokens from `issuer` signed by `public_key`
    pub fn new(
        issuer: &str,
        public_key: &RsaPublicKey,
        leeway: Duration,
    ) -> Result<Self, TokenError> {
        let der = public_key
            .to_pkcs1_der()
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;

        // Time claims are checked in validate_at so the clock is injectable.
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);

        Ok(Self {
            key: DecodingKey::from_rsa_der(der.as_bytes()),
            validation,
            leeway: leeway.as_secs() as i64,
        })
    }

    /// Verify `token` against the current time
    pub fn validate(&self, token: &str) -> Result<Payload, TokenError> {
        self.validate_at(token, now_unix())
    }

    /// Verify `token` as if the current Unix time were `now`
    ///
    /// Expiry is inclusive of the leeway: a token with `exp + leeway == now`
    /// is still accepted.
    pub fn validate_at(&self, token: &str, now: i64) -> Result<Payload, TokenError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    TokenError::InvalidSignature
                }
                ErrorKind::InvalidIssuer => TokenError::InvalidIssuer,
                _ => TokenError::Malformed(e.to_string()),
            }
        })?;

        let claims = data.claims;
        if claims.exp.saturating_add(self.leeway) < now {
            return Err(TokenError::Expired);
        }
        if claims.nbf.saturating_sub(self.leeway) > now {
            return Err(TokenError::NotYetValid);
        }

        Ok(claims.payload)
    }
}

/// Checks that a verified payload authorizes an upload
pub struct UploadTokenPolicy;

impl UploadTokenPolicy {
    /// Accept only uploads into a named, namespaced claim
    pub fn check(payload: &Payload) -> Result<(), TokenError> {
        if payload.operation != Operation::Upload {
            return Err(TokenError::MalformedClaims(format!(
                "operation {:?} is not an upload",
                payload.operation
            )));
        }
        if payload.resource.resource != PVC_RESOURCE {
            return Err(TokenError::MalformedClaims(format!(
                "resource {} is not {}",
                payload.resource.resource, PVC_RESOURCE
            )));
        }
        if payload.name.is_empty() || payload.namespace.is_empty() {
            return Err(TokenError::MalformedClaims(
                "name and namespace are required".to_string(),
            ));
        }
        Ok(())
    }
}

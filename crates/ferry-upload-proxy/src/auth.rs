//! Upload request authentication

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use regex::Regex;
use tracing::{debug, warn};

use ferry_auth::{Payload, TokenError, TokenValidator, UploadTokenPolicy};

use crate::error::{Error, Result};

/// Accepted `Authorization` header shape; group 1 is the token
pub const AUTH_HEADER_PATTERN: &str = r"(?i)^Bearer\s+([A-Za-z0-9\-._~+/]+=*)$";

/// Pulls the bearer token out of request headers
#[derive(Debug, Clone)]
pub struct TokenExtractor {
    pattern: Regex,
}

impl TokenExtractor {
    /// Extractor for [`AUTH_HEADER_PATTERN`]
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(AUTH_HEADER_PATTERN)
            .map_err(|e| Error::Internal(format!("invalid authorization pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    /// The bearer token, borrowed from `headers`
    pub fn extract<'a>(&self, headers: &'a HeaderMap) -> Result<&'a str> {
        let value = headers
            .get(AUTHORIZATION)
            .ok_or(Error::MissingAuthorization)?
            .to_str()
            .map_err(|_| Error::MalformedAuthorization)?;

        if value.is_empty() {
            return Err(Error::MissingAuthorization);
        }

        self.pattern
            .captures(value)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or(Error::MalformedAuthorization)
    }
}

/// Authenticates upload requests and checks what their token allows
pub struct UploadAuthorizer {
    extractor: TokenExtractor,
    validator: TokenValidator,
}

impl UploadAuthorizer {
    /// Verify tokens with `validator`
    pub fn new(validator: TokenValidator) -> Result<Self> {
        Ok(Self {
            extractor: TokenExtractor::new()?,
            validator,
        })
    }

    /// The verified upload payload carried by `headers`
    pub fn authorize(&self, headers: &HeaderMap) -> Result<Payload> {
        let token = self.extractor.extract(headers).inspect_err(|e| match e {
            Error::MissingAuthorization => warn!("Rejecting upload: no authorization header"),
            _ => warn!("Rejecting upload: malformed authorization header"),
        })?;

        let payload = self.validator.validate(token).inspect_err(|e| match e {
            TokenError::InvalidSignature => warn!("Rejecting upload: invalid token signature"),
            TokenError::Expired => warn!("Rejecting upload: token expired"),
            TokenError::InvalidIssuer => warn!("Rejecting upload: unexpected token issuer"),
            other => warn!(error = %other, "Rejecting upload: unusable token"),
        })?;

        UploadTokenPolicy::check(&payload).inspect_err(|e| {
            warn!(
                error = %e,
                operation = ?payload.operation,
                resource = %payload.resource.resource,
                "Rejecting upload: token does not authorize an upload"
            )
        })?;

        debug!(namespace = %payload.namespace, name = %payload.name, "Received valid upload token");
        Ok(payload)
    }
}

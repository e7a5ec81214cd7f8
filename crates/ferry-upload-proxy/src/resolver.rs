//! Backend URL resolution

use ferry_common::{
    ANN_CONTENT_TYPE, CONTENT_TYPE_ARCHIVE, CONTENT_TYPE_KUBEVIRT, UPLOAD_ARCHIVE_ALPHA_PATH,
    UPLOAD_ARCHIVE_PATH,
};

use crate::error::{Error, Result};
use crate::readiness::TargetState;

/// Name base of per-claim upload server resources
pub const UPLOAD_RESOURCE_BASE: &str = "cdi-upload";

const DNS1123_SUBDOMAIN_MAX_LENGTH: usize = 253;
const DNS1035_LABEL_MAX_LENGTH: usize = 63;

/// Marks a resource name shortened to fit a service label
const SHORTENED_LABEL_SUFFIX: &str = "cdi";

/// Maps an upload target to the URL of its upload server
pub trait UrlResolver: Send + Sync {
    /// URL for `path` on the server receiving uploads into `namespace/name`
    fn resolve(&self, namespace: &str, name: &str, path: &str) -> String;
}

/// Resolves to the in-cluster service fronting each upload server
///
/// Upload servers for a claim are named `<base>-<claim>`, shortened with a
/// hash when that exceeds the object name limit, and their service names are
/// shortened again to fit a DNS-1035 label. Names must match the ones the
/// upload controller creates, so the shortening rule is fixed.
#[derive(Debug, Clone)]
pub struct ServiceUrlResolver {
    base: String,
}

impl ServiceUrlResolver {
    /// Resolve to services derived from `<base>-<claim>`
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// Service name for uploads into `claim`
    pub fn service_name(&self, claim: &str) -> String {
        let resource = shortened_name(&self.base, claim, DNS1123_SUBDOMAIN_MAX_LENGTH);
        if resource.len() <= DNS1035_LABEL_MAX_LENGTH {
            return resource;
        }
        shortened_name(&resource, SHORTENED_LABEL_SUFFIX, DNS1035_LABEL_MAX_LENGTH)
    }
}

impl Default for ServiceUrlResolver {
    fn default() -> Self {
        Self::new(UPLOAD_RESOURCE_BASE)
    }
}

impl UrlResolver for ServiceUrlResolver {
    fn resolve(&self, namespace: &str, name: &str, path: &str) -> String {
        format!(
            "https://{}.{}.svc{}",
            self.service_name(name),
            namespace,
            path
        )
    }
}

/// `<base>-<suffix>`, or a hashed shortening of it no longer than `max_len`
fn shortened_name(base: &str, suffix: &str, max_len: usize) -> String {
    let name = format!("{}-{}", base, suffix);
    if name.len() <= max_len {
        return name;
    }

    // Room for "-" + 8 hex digits + "-" + suffix
    match max_len.checked_sub(10 + suffix.len()) {
        Some(base_len) => format!(
            "{}-{:08x}-{}",
            truncate(base, base_len),
            fnv1a_32(base),
            suffix
        ),
        None => {
            let short = format!(
                "{}-{:08x}",
                truncate(base, max_len.saturating_sub(9)),
                fnv1a_32(&name)
            );
            truncate(&short, max_len).to_string()
        }
    }
}

/// Longest prefix of `s` that is at most `max` bytes and ends on a char boundary
fn truncate(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// 32-bit FNV-1a
fn fnv1a_32(s: &str) -> u32 {
    s.bytes().fold(0x811c_9dc5, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}

/// Upload server path for a request received on `inbound_path`
///
/// Archive targets are served from a dedicated endpoint; everything else
/// keeps the inbound path.
pub fn resolve_upload_path(target: &TargetState, inbound_path: &str) -> Result<String> {
    let content_type = target
        .annotations
        .get(ANN_CONTENT_TYPE)
        .map(String::as_str)
        .unwrap_or("");

    match content_type {
        "" | CONTENT_TYPE_KUBEVIRT => Ok(inbound_path.to_string()),
        CONTENT_TYPE_ARCHIVE if inbound_path.contains("alpha") => {
            Ok(UPLOAD_ARCHIVE_ALPHA_PATH.to_string())
        }
        CONTENT_TYPE_ARCHIVE => Ok(UPLOAD_ARCHIVE_PATH.to_string()),
        other => Err(Error::InvalidContentType {
            name: target.name.clone(),
            content_type: other.to_string(),
        }),
    }
}

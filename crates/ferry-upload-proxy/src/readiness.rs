//! Readiness gate for upload targets
//!
//! The upload server for a claim is started asynchronously by a controller,
//! which reports progress through annotations on the claim. The gate polls
//! those annotations until the server is ready, the upload has already
//! completed, the claim disappears, or the deadline passes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{Api, Client};
use tokio::time::Instant;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use ferry_common::kube_utils::{is_not_found, poll_until, PollOutcome};
use ferry_common::{
    Error as CommonError, ANN_API_GROUP, ANN_POD_PHASE, ANN_POD_READY, ANN_PVC_PRIME_NAME,
    ANN_UPLOAD_REQUEST, POD_PHASE_SUCCEEDED, VOLUME_UPLOAD_SOURCE_KIND,
};

/// How long and how often to poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Delay between reads
    pub poll_interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Annotations of the object an upload lands in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetState {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Object annotations
    pub annotations: BTreeMap<String, String>,
}

impl TargetState {
    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// One read of a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetLookup {
    /// The object to evaluate
    Found(TargetState),
    /// The target exists but the object to evaluate is not known yet
    Pending,
    /// The target does not exist
    NotFound,
}

/// Reads upload target state
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetReader: Send + Sync {
    /// Read the current state of `namespace/name`
    async fn get_target(&self, namespace: &str, name: &str) -> Result<TargetLookup, CommonError>;
}

/// [`TargetReader`] over persistent volume claims
///
/// Claims populated from a `VolumeUploadSource` receive their data through
/// an intermediate claim named by the prime annotation; that claim is the
/// one evaluated and uploaded to.
#[derive(Clone)]
pub struct KubeTargetReader {
    client: Client,
}

impl KubeTargetReader {
    /// Read claims through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TargetReader for KubeTargetReader {
    async fn get_target(&self, namespace: &str, name: &str) -> Result<TargetLookup, CommonError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);

        let pvc = match api.get(name).await {
            Ok(pvc) => pvc,
            Err(e) if is_not_found(&e) => return Ok(TargetLookup::NotFound),
            Err(e) => return Err(e.into()),
        };

        if !is_upload_populated(&pvc) {
            return Ok(TargetLookup::Found(target_state(namespace, pvc)));
        }

        let Some(prime_name) = pvc
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANN_PVC_PRIME_NAME))
        else {
            debug!(namespace, name, "Waiting for populator to name the prime claim");
            return Ok(TargetLookup::Pending);
        };

        match api.get(prime_name).await {
            Ok(prime) => Ok(TargetLookup::Found(target_state(namespace, prime))),
            Err(e) if is_not_found(&e) => {
                debug!(namespace, name, prime = %prime_name, "Prime claim not created yet");
                Ok(TargetLookup::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn is_upload_populated(pvc: &PersistentVolumeClaim) -> bool {
    pvc.spec
        .as_ref()
        .and_then(|spec| spec.data_source_ref.as_ref())
        .is_some_and(|source| {
            source.kind == VOLUME_UPLOAD_SOURCE_KIND
                && source.api_group.as_deref() == Some(ANN_API_GROUP)
        })
}

fn target_state(namespace: &str, pvc: PersistentVolumeClaim) -> TargetState {
    TargetState {
        name: pvc.metadata.name.unwrap_or_default(),
        namespace: pvc
            .metadata
            .namespace
            .unwrap_or_else(|| namespace.to_string()),
        annotations: pvc.metadata.annotations.unwrap_or_default(),
    }
}

/// Readiness failures
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    /// The target does not exist
    #[error("rejecting upload request for {namespace}/{name}: target does not exist")]
    TargetNotFound {
        /// Target namespace
        namespace: String,
        /// Target name
        name: String,
    },

    /// The upload into the target already finished
    #[error("rejecting upload request for {namespace}/{name}: upload already completed")]
    AlreadyCompleted {
        /// Target namespace
        namespace: String,
        /// Target name
        name: String,
    },

    /// The target was not created for uploads
    #[error("rejecting upload request for {namespace}/{name}: not an upload target")]
    NotUploadTarget {
        /// Target namespace
        namespace: String,
        /// Target name
        name: String,
    },

    /// The target did not become ready in time
    #[error("upload server for {namespace}/{name} not ready after {waited:?}")]
    Timeout {
        /// Target namespace
        namespace: String,
        /// Target name
        name: String,
        /// How long the gate waited
        waited: Duration,
    },

    /// Reading the target failed
    #[error("failed to read upload target: {0}")]
    Store(#[from] CommonError),
}

/// Waits for upload targets to become ready
#[derive(Clone)]
pub struct ReadinessGate {
    reader: Arc<dyn TargetReader>,
    policy: ReadinessPolicy,
}

impl ReadinessGate {
    /// Poll `reader` according to `policy`
    pub fn new(reader: Arc<dyn TargetReader>, policy: ReadinessPolicy) -> Self {
        Self { reader, policy }
    }

    /// Block until `namespace/name` is ready to receive an upload
    ///
    /// Returns the state of the object to upload into, which differs from
    /// the requested target when the claim is populated indirectly.
    pub async fn wait_until_ready(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<TargetState, ReadinessError> {
        let start = Instant::now();
        let outcome = poll_until(self.policy.timeout, self.policy.poll_interval, move || async move {
            match self.reader.get_target(namespace, name).await? {
                TargetLookup::Found(state) => evaluate(state),
                TargetLookup::Pending => Ok(None),
                TargetLookup::NotFound => Err(ReadinessError::TargetNotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }),
            }
        })
        .await?;

        match outcome {
            PollOutcome::Ready(state) => Ok(state),
            PollOutcome::TimedOut => {
                let waited = start.elapsed();
                warn!(namespace, name, ?waited, "Upload target not ready in time");
                Err(ReadinessError::Timeout {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    waited,
                })
            }
        }
    }
}

fn evaluate(state: TargetState) -> Result<Option<TargetState>, ReadinessError> {
    if state.annotation(ANN_UPLOAD_REQUEST).is_none() {
        return Err(ReadinessError::NotUploadTarget {
            namespace: state.namespace,
            name: state.name,
        });
    }

    if state.annotation(ANN_POD_PHASE) == Some(POD_PHASE_SUCCEEDED) {
        return Err(ReadinessError::AlreadyCompleted {
            namespace: state.namespace,
            name: state.name,
        });
    }

    // Written by another controller; unparsable means not ready.
    let ready = state
        .annotation(ANN_POD_READY)
        .and_then(parse_bool)
        .unwrap_or(false);

    Ok(ready.then_some(state))
}

/// Boolean spellings accepted in annotations
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

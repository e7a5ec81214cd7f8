//! RSA signing key persisted in a Kubernetes Secret
//!
//! Several replicas may start at once and all find the Secret missing. Each
//! generates a candidate key and tries to create the Secret; exactly one
//! create succeeds. Losers see a conflict, re-read the Secret and adopt the
//! winner's key, so every caller ends up holding the same key pair.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::api::PostParams;
use kube::{Api, Client};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

use ferry_common::kube_utils::{is_conflict, is_not_found};
use ferry_common::{Error, COMPONENT_LABEL, KEYSTORE_PRIVATE_KEY, KEYSTORE_PUBLIC_KEY};

/// Size of generated signing keys, and the minimum accepted on decode
pub const KEY_SIZE_BITS: usize = 2048;

/// Label value marking keystore secrets
pub const KEYSTORE_LABEL_VALUE: &str = "keystore";

/// Keystore errors
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// The secret store failed
    #[error("secret store error: {0}")]
    Store(#[from] Error),

    /// The secret exists but lacks the private key field
    #[error("secret {name} has no {field} field")]
    MissingField {
        /// Secret name
        name: String,
        /// Missing data key
        field: String,
    },

    /// The stored key is not a PEM-encoded RSA key
    #[error("failed to decode key: {0}")]
    Decode(String),

    /// The stored key is too small to sign with
    #[error("RSA key is {bits} bits, need at least {KEY_SIZE_BITS}")]
    WeakKey {
        /// Modulus size of the rejected key
        bits: usize,
    },

    /// Generating a fresh key failed
    #[error("failed to generate key: {0}")]
    KeyGeneration(String),
}

/// Result of a conditional create
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// This caller created the secret
    Created(Secret),
    /// A secret with that name already exists
    AlreadyExists,
}

/// Secret persistence used by the keystore
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret, `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a secret unless one with the same name exists
    async fn create(&self, namespace: &str, secret: Secret) -> Result<CreateOutcome, Error>;
}

/// [`SecretStore`] backed by the Kubernetes API
///
/// Secrets created without an owner reference get the store's default
/// owner, when one is configured, so they are garbage collected with the
/// deployment that owns the keystore.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
    default_owner: Option<OwnerReference>,
}

impl KubeSecretStore {
    /// Store secrets through `client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            default_owner: None,
        }
    }

    /// Own created secrets by `owner` unless the caller supplied an owner
    pub fn with_default_owner(mut self, owner: OwnerReference) -> Self {
        self.default_owner = Some(owner);
        self
    }
}

/// Attach `default_owner` to `secret` if it has no owner references yet
fn with_owner_fallback(mut secret: Secret, default_owner: Option<&OwnerReference>) -> Secret {
    let unowned = secret
        .metadata
        .owner_references
        .as_ref()
        .map_or(true, Vec::is_empty);
    if unowned {
        if let Some(owner) = default_owner {
            secret.metadata.owner_references = Some(vec![owner.clone()]);
        }
    }
    secret
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, namespace: &str, secret: Secret) -> Result<CreateOutcome, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = with_owner_fallback(secret, self.default_owner.as_ref());
        match api.create(&PostParams::default(), &secret).await {
            Ok(created) => Ok(CreateOutcome::Created(created)),
            Err(e) if is_conflict(&e) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }
}

/// Which branch produced the key returned by [`get_or_create_private_key`]
#[derive(Debug, Clone)]
pub enum KeyPairOutcome {
    /// The secret already existed
    Existing(RsaPrivateKey),
    /// This caller created the secret
    Created(RsaPrivateKey),
    /// Another caller created the secret first; this is its key
    LostRace(RsaPrivateKey),
}

impl KeyPairOutcome {
    /// The key, whichever branch produced it
    pub fn into_key(self) -> RsaPrivateKey {
        match self {
            Self::Existing(key) | Self::Created(key) | Self::LostRace(key) => key,
        }
    }

    /// Borrow the key
    pub fn key(&self) -> &RsaPrivateKey {
        match self {
            Self::Existing(key) | Self::Created(key) | Self::LostRace(key) => key,
        }
    }
}

/// Get the signing key stored in secret `name`, creating it if absent
///
/// A create that conflicts re-reads the secret once and returns the stored
/// key. Store failures other than not-found and conflict are returned as is.
///
/// `owner` is set on a newly created secret. With `None` the secret is
/// created unowned and the store decides; [`KubeSecretStore`] falls back to
/// its default owner.
pub async fn get_or_create_private_key<S>(
    store: &S,
    namespace: &str,
    name: &str,
    owner: Option<&OwnerReference>,
) -> Result<KeyPairOutcome, KeyStoreError>
where
    S: SecretStore + ?Sized,
{
    if let Some(secret) = store.get(namespace, name).await? {
        debug!(namespace, name, "Using existing signing key");
        return decode_secret(name, &secret).map(KeyPairOutcome::Existing);
    }

    let key = generate_private_key().await?;
    let secret = build_keystore_secret(namespace, name, &key, owner)?;

    match store.create(namespace, secret).await? {
        CreateOutcome::Created(_) => {
            info!(namespace, name, "Created signing key secret");
            Ok(KeyPairOutcome::Created(key))
        }
        CreateOutcome::AlreadyExists => {
            debug!(namespace, name, "Signing key secret created concurrently, re-reading");
            let secret = store.get(namespace, name).await?.ok_or_else(|| {
                Error::internal_with_context(
                    "get_or_create_private_key",
                    format!("secret {namespace}/{name} conflicted on create but is missing"),
                )
            })?;
            decode_secret(name, &secret).map(KeyPairOutcome::LostRace)
        }
    }
}

async fn generate_private_key() -> Result<RsaPrivateKey, KeyStoreError> {
    tokio::task::spawn_blocking(|| RsaPrivateKey::new(&mut rand::thread_rng(), KEY_SIZE_BITS))
        .await
        .map_err(|e| KeyStoreError::KeyGeneration(e.to_string()))?
        .map_err(|e| KeyStoreError::KeyGeneration(e.to_string()))
}

fn build_keystore_secret(
    namespace: &str,
    name: &str,
    key: &RsaPrivateKey,
    owner: Option<&OwnerReference>,
) -> Result<Secret, KeyStoreError> {
    let private_pem = encode_private_key_pem(key)?;
    let public_pem = encode_public_key_pem(&key.to_public_key())?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                COMPONENT_LABEL.to_string(),
                KEYSTORE_LABEL_VALUE.to_string(),
            )])),
            owner_references: owner.map(|o| vec![o.clone()]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([
            (
                KEYSTORE_PRIVATE_KEY.to_string(),
                ByteString(private_pem.as_bytes().to_vec()),
            ),
            (
                KEYSTORE_PUBLIC_KEY.to_string(),
                ByteString(public_pem.into_bytes()),
            ),
        ])),
        ..Default::default()
    })
}

fn decode_secret(name: &str, secret: &Secret) -> Result<RsaPrivateKey, KeyStoreError> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(KEYSTORE_PRIVATE_KEY))
        .ok_or_else(|| KeyStoreError::MissingField {
            name: name.to_string(),
            field: KEYSTORE_PRIVATE_KEY.to_string(),
        })?;

    let pem = std::str::from_utf8(&bytes.0)
        .map_err(|_| KeyStoreError::Decode("private key is not valid UTF-8".to_string()))?;
    decode_private_key_pem(pem)
}

/// Encode a private key as PKCS#1 PEM
pub fn encode_private_key_pem(key: &RsaPrivateKey) -> Result<Zeroizing<String>, KeyStoreError> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| KeyStoreError::Decode(format!("failed to encode private key: {}", e)))
}

/// Encode a public key as PKIX PEM
pub fn encode_public_key_pem(key: &RsaPublicKey) -> Result<String, KeyStoreError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| KeyStoreError::Decode(format!("failed to encode public key: {}", e)))
}

/// Decode a PKCS#1 or PKCS#8 PEM private key of at least [`KEY_SIZE_BITS`]
pub fn decode_private_key_pem(pem: &str) -> Result<RsaPrivateKey, KeyStoreError> {
    let key = RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| KeyStoreError::Decode(format!("not an RSA private key: {}", e)))?;
    check_size(key.size())?;
    Ok(key)
}

/// Decode a PKIX PEM public key of at least [`KEY_SIZE_BITS`]
pub fn decode_public_key_pem(pem: &str) -> Result<RsaPublicKey, KeyStoreError> {
    let key = RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| KeyStoreError::Decode(format!("not an RSA public key: {}", e)))?;
    check_size(key.size())?;
    Ok(key)
}

fn check_size(modulus_bytes: usize) -> Result<(), KeyStoreError> {
    let bits = modulus_bytes * 8;
    if bits < KEY_SIZE_BITS {
        return Err(KeyStoreError::WeakKey { bits });
    }
    Ok(())
}

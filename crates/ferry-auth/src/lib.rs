//! Signing keys and upload tokens
//!
//! [`keystore`] persists the RSA key pair the token issuer signs with in a
//! Kubernetes Secret, converging concurrent creators on a single winner.
//! [`token`] issues and validates the short-lived RS256 tokens that authorize
//! an upload to one specific claim.

#![deny(missing_docs)]

pub mod keystore;
pub mod token;

pub use keystore::{
    decode_private_key_pem, decode_public_key_pem, encode_private_key_pem, encode_public_key_pem,
    get_or_create_private_key, CreateOutcome, KeyPairOutcome, KeyStoreError, KubeSecretStore,
    SecretStore,
};
pub use token::{
    GroupVersionResource, Operation, Payload, TokenError, TokenGenerator, TokenValidator,
    UploadTokenPolicy, DEFAULT_LEEWAY,
};

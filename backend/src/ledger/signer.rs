use std::fmt;

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use stellar_strkey::ed25519::{PrivateKey, PublicKey};
use thiserror::Error;

use super::{transaction_hash, EnvelopeError, PreparedTransaction, SignedTransaction};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    #[error("secret key is not a valid S... strkey")]
    InvalidSecret,

    #[error("public key {0} is not a valid G... strkey")]
    InvalidPublicKey(String),

    #[error("signature is not valid hex ed25519")]
    MalformedSignature,

    #[error("transaction source {source_account} does not match signer {signer}")]
    SourceMismatch {
        source_account: String,
        signer: String,
    },

    #[error("invalid signature")]
    InvalidSignature,

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Ed25519 identity that signs transactions on behalf of an account.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
    address: String,
}

impl Signer {
    pub fn from_secret(secret: &str) -> Result<Self, SignerError> {
        let PrivateKey(seed) =
            PrivateKey::from_string(secret.trim()).map_err(|_| SignerError::InvalidSecret)?;
        Ok(Self::from_seed(seed))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let key = SigningKey::from_bytes(&seed);
        let address = PublicKey(key.verifying_key().to_bytes()).to_string();
        Self { key, address }
    }

    /// Account address, `G...`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Secret seed, `S...`.
    pub fn secret(&self) -> String {
        PrivateKey(self.key.to_bytes()).to_string()
    }

    /// Sign the network hash of `prepared`. Fails only when the transaction
    /// has no XDR form (bad address, oversized argument).
    pub fn sign(
        &self,
        network_passphrase: &str,
        prepared: PreparedTransaction,
    ) -> Result<SignedTransaction, SignerError> {
        let hash = transaction_hash(network_passphrase, &prepared)?;
        let signature = self.key.sign(&hash);
        Ok(SignedTransaction {
            prepared,
            public_key: self.address.clone(),
            signature: hex::encode(signature.to_bytes()),
        })
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Check that `signed` carries a valid signature by its own source account.
pub fn verify(network_passphrase: &str, signed: &SignedTransaction) -> Result<(), SignerError> {
    let source = &signed.prepared.tx.source;
    if *source != signed.public_key {
        return Err(SignerError::SourceMismatch {
            source_account: source.clone(),
            signer: signed.public_key.clone(),
        });
    }

    let PublicKey(raw) = PublicKey::from_string(&signed.public_key)
        .map_err(|_| SignerError::InvalidPublicKey(signed.public_key.clone()))?;
    let key = VerifyingKey::from_bytes(&raw)
        .map_err(|_| SignerError::InvalidPublicKey(signed.public_key.clone()))?;

    let bytes = hex::decode(&signed.signature).map_err(|_| SignerError::MalformedSignature)?;
    let signature = Signature::from_slice(&bytes).map_err(|_| SignerError::MalformedSignature)?;

    let hash = transaction_hash(network_passphrase, &signed.prepared)?;
    key.verify(&hash, &signature)
        .map_err(|_| SignerError::InvalidSignature)
}

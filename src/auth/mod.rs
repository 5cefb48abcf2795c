use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hex::FromHex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ledger::Amount;
use crate::registry::ProjectId;

/// Lowercase hex of a 32-byte ed25519 verifying key.
pub type AccountId = String;

const COMMAND_DOMAIN: &[u8] = b"cgov-command-v1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("malformed account id {0:?}: expected a 64-character hex ed25519 key")]
    MalformedAccount(String),
    #[error("malformed secret key: expected 64 hex characters")]
    MalformedSecret,
    #[error("malformed signature from {0}")]
    MalformedSignature(AccountId),
    #[error("invalid signature from {0}")]
    InvalidSignature(AccountId),
}

/// Parse and normalise an account id. The id must decode to a valid ed25519
/// point so credits can never be sent to a key nobody can sign for.
pub fn parse_account(raw: &str) -> Result<AccountId, AuthError> {
    verifying_key(raw).map(|key| hex::encode(key.as_bytes()))
}

fn verifying_key(raw: &str) -> Result<VerifyingKey, AuthError> {
    let bytes = <[u8; 32]>::from_hex(raw.trim())
        .map_err(|_| AuthError::MalformedAccount(raw.to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| AuthError::MalformedAccount(raw.to_string()))
}

/// The authenticated origin of an operation.
///
/// A `Caller` can only be obtained from an [`Identity`] (possession of the
/// signing key) or from a successfully authenticated [`SignedCommand`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Caller {
    account: AccountId,
}

impl Caller {
    pub fn account(&self) -> &AccountId {
        &self.account
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.account)
    }
}

/// An ed25519 keypair that acts as a caller.
pub struct Identity {
    key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        let mut rng = OsRng;
        Self {
            key: SigningKey::generate(&mut rng),
        }
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self, AuthError> {
        let bytes = <[u8; 32]>::from_hex(secret.trim()).map_err(|_| AuthError::MalformedSecret)?;
        Ok(Self {
            key: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    pub fn account_id(&self) -> AccountId {
        hex::encode(self.key.verifying_key().as_bytes())
    }

    pub fn caller(&self) -> Caller {
        Caller {
            account: self.account_id(),
        }
    }

    pub fn sign(&self, nonce: u64, command: Command) -> SignedCommand {
        let signer = self.account_id();
        let digest = command_digest(&signer, nonce, &command);
        let signature = self.key.sign(&digest);
        SignedCommand {
            signer,
            nonce,
            command,
            signature: signature.to_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("account", &self.account_id())
            .finish_non_exhaustive()
    }
}

/// A state-changing request, as submitted by a caller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    SubmitProject { name: String, details: String },
    VerifyProject { project_id: ProjectId },
    Mint { to: AccountId, amount: Amount },
    Burn { amount: Amount },
    Transfer { to: AccountId, amount: Amount },
    Vote { project_id: ProjectId },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SubmitProject { .. } => "submit_project",
            Command::VerifyProject { .. } => "verify_project",
            Command::Mint { .. } => "mint",
            Command::Burn { .. } => "burn",
            Command::Transfer { .. } => "transfer",
            Command::Vote { .. } => "vote",
        }
    }

    /// Unambiguous byte encoding covered by the signature.
    pub fn commitment(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_str(&mut buf, self.name());
        match self {
            Command::SubmitProject { name, details } => {
                put_str(&mut buf, name);
                put_str(&mut buf, details);
            }
            Command::VerifyProject { project_id } | Command::Vote { project_id } => {
                buf.extend_from_slice(&project_id.to_le_bytes());
            }
            Command::Mint { to, amount } | Command::Transfer { to, amount } => {
                put_str(&mut buf, to);
                buf.extend_from_slice(&amount.to_le_bytes());
            }
            Command::Burn { amount } => {
                buf.extend_from_slice(&amount.to_le_bytes());
            }
        }
        buf
    }
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u64).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn command_digest(signer: &str, nonce: u64, command: &Command) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(COMMAND_DOMAIN);
    hasher.update(signer.as_bytes());
    hasher.update(nonce.to_le_bytes());
    hasher.update(command.commitment());
    hasher.finalize().into()
}

/// A command envelope signed by its originator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedCommand {
    pub signer: AccountId,
    pub nonce: u64,
    pub command: Command,
    #[serde(with = "crate::auth::serde_bytes")]
    pub signature: Vec<u8>,
}

impl SignedCommand {
    pub fn digest(&self) -> [u8; 32] {
        command_digest(&self.signer, self.nonce, &self.command)
    }

    /// Check the signature and return the caller it proves.
    pub fn authenticate(&self) -> Result<Caller, AuthError> {
        let key = verifying_key(&self.signer)?;
        let account = hex::encode(key.as_bytes());
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| AuthError::MalformedSignature(account.clone()))?;
        key.verify_strict(&self.digest(), &signature)
            .map_err(|_| AuthError::InvalidSignature(account.clone()))?;
        Ok(Caller { account })
    }
}

pub(crate) mod serde_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}

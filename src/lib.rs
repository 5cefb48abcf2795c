//! Carbon credit ledger, project registry and token-weighted verification
//! voting.
//!
//! The crate is organised around three components that a [`Deployment`]
//! wires together under a single administrator:
//!
//! * [`ledger`]: credit balances with administrative issuance, self-service
//!   destruction and transfers.
//! * [`registry`]: submitted projects and their one-way `verified` flag.
//! * [`governance`]: per-project vote receipts and tallies; a project is
//!   verified by the vote whose increment first reaches the configured quorum.
//!
//! Callers are identified by ed25519 keys ([`auth`]); every mutating operation
//! takes an authenticated [`Caller`] rather than a free-form account string.

pub mod auth;
pub mod config;
pub mod deployment;
pub mod governance;
pub mod ledger;
pub mod registry;
pub mod store;

mod error;

pub use auth::{AccountId, Caller, Command, Identity, SignedCommand};
pub use config::{GovernanceConfig, PostVerificationPolicy, Settings};
pub use deployment::{CommandOutcome, Deployment, DeploymentSnapshot};
pub use error::{Error, ErrorKind, Result};
pub use governance::{GovernanceEngine, VoteOutcome};
pub use ledger::{Amount, Ledger};
pub use registry::{ProjectId, ProjectRecord, Registry};

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::{parse_account, AccountId, Caller, Command, SignedCommand};
use crate::config::GovernanceConfig;
use crate::error::{Error, Result};
use crate::governance::{GovernanceEngine, VoteBook, VoteOutcome};
use crate::ledger::{Amount, Ledger, LedgerState};
use crate::registry::{ProjectId, ProjectRecord, Registry, RegistryState};
use crate::store::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditAction {
    ProjectSubmitted {
        project_id: ProjectId,
        name: String,
    },
    ProjectVerified {
        project_id: ProjectId,
        changed: bool,
    },
    Minted {
        to: AccountId,
        amount: Amount,
    },
    Burned {
        amount: Amount,
    },
    Transferred {
        to: AccountId,
        amount: Amount,
    },
    Voted {
        project_id: ProjectId,
        tally: u64,
        crossed_threshold: bool,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub seq: u64,
    pub initiator: AccountId,
    pub action: AuditAction,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandOutcome {
    ProjectSubmitted {
        project_id: ProjectId,
    },
    ProjectVerified {
        project_id: ProjectId,
        changed: bool,
    },
    Minted {
        to: AccountId,
        amount: Amount,
        balance: Amount,
    },
    Burned {
        amount: Amount,
        balance: Amount,
    },
    Transferred {
        to: AccountId,
        amount: Amount,
        balance: Amount,
    },
    Voted(VoteOutcome),
}

/// Everything needed to rebuild a [`Deployment`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentSnapshot {
    pub admin: AccountId,
    pub governance: GovernanceConfig,
    pub ledger: LedgerState,
    /// Hex Merkle root over `ledger.balances`, checked on restore.
    pub ledger_root: String,
    pub registry: RegistryState,
    pub votes: VoteBook,
    #[serde(default)]
    pub nonces: BTreeMap<AccountId, u64>,
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
}

#[derive(Default)]
struct Journal {
    nonces: BTreeMap<AccountId, u64>,
    audit: Vec<AuditEntry>,
}

impl Journal {
    fn next_nonce(&self, account: &AccountId) -> u64 {
        self.nonces.get(account).copied().unwrap_or(0)
    }

    fn consume_nonce(&mut self, account: &AccountId) {
        *self.nonces.entry(account.clone()).or_insert(0) += 1;
    }

    fn record(&mut self, initiator: &Caller, action: AuditAction) {
        let seq = self.audit.len() as u64 + 1;
        self.audit.push(AuditEntry {
            seq,
            initiator: initiator.account().clone(),
            action,
        });
    }
}

/// A ledger, a registry and a governance engine administered by one account.
///
/// All mutations pass through the journal lock, so they are applied in a
/// single global order and each one is audited with its initiator.
pub struct Deployment {
    admin: AccountId,
    ledger: Arc<Ledger>,
    registry: Arc<Registry>,
    governance: GovernanceEngine,
    journal: Mutex<Journal>,
}

impl Deployment {
    pub fn new(admin: &Caller, config: GovernanceConfig) -> Self {
        let ledger = Arc::new(Ledger::new(admin));
        let registry = Arc::new(Registry::new(admin));
        let governance = GovernanceEngine::new(config, Arc::clone(&ledger), Arc::clone(&registry));
        info!(
            admin = %admin,
            quorum = governance.quorum(),
            policy = %governance.config().post_verification,
            "deployment created"
        );
        Self {
            admin: admin.account().clone(),
            ledger,
            registry,
            governance,
            journal: Mutex::new(Journal::default()),
        }
    }

    pub fn admin(&self) -> &AccountId {
        &self.admin
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn governance(&self) -> &GovernanceEngine {
        &self.governance
    }

    pub fn config(&self) -> &GovernanceConfig {
        self.governance.config()
    }

    //==================== mutating surface ====================//

    pub fn submit_project(
        &self,
        caller: &Caller,
        name: impl Into<String>,
        details: impl Into<String>,
    ) -> Result<ProjectId> {
        let mut journal = self.journal.lock();
        Ok(self.submit_locked(&mut journal, caller, name.into(), details.into()))
    }

    /// Administrative verification, independent of voting. Returns whether
    /// the project changed state.
    pub fn verify_project(&self, caller: &Caller, project_id: ProjectId) -> Result<bool> {
        let mut journal = self.journal.lock();
        self.verify_locked(&mut journal, caller, project_id)
    }

    pub fn mint(&self, caller: &Caller, to: &str, amount: Amount) -> Result<()> {
        let mut journal = self.journal.lock();
        self.mint_locked(&mut journal, caller, to, amount).map(|_| ())
    }

    pub fn burn(&self, caller: &Caller, amount: Amount) -> Result<()> {
        let mut journal = self.journal.lock();
        self.burn_locked(&mut journal, caller, amount).map(|_| ())
    }

    pub fn transfer(&self, caller: &Caller, to: &str, amount: Amount) -> Result<()> {
        let mut journal = self.journal.lock();
        self.transfer_locked(&mut journal, caller, to, amount).map(|_| ())
    }

    pub fn vote_for_project(&self, caller: &Caller, project_id: ProjectId) -> Result<VoteOutcome> {
        let mut journal = self.journal.lock();
        self.vote_locked(&mut journal, caller, project_id)
    }

    /// Authenticate a signed envelope, check its nonce and apply it.
    ///
    /// The nonce is consumed only when the command succeeds.
    pub fn execute(&self, envelope: &SignedCommand) -> Result<CommandOutcome> {
        let caller = envelope.authenticate()?;
        let mut journal = self.journal.lock();

        let expected = journal.next_nonce(caller.account());
        if envelope.nonce != expected {
            warn!(
                initiator = %caller,
                expected,
                got = envelope.nonce,
                "stale command envelope"
            );
            return Err(Error::StaleNonce {
                account: caller.account().clone(),
                expected,
                got: envelope.nonce,
            });
        }

        let outcome = self.apply(&mut journal, &caller, &envelope.command);
        match &outcome {
            Ok(_) => journal.consume_nonce(caller.account()),
            Err(err) => warn!(
                initiator = %caller,
                command = envelope.command.name(),
                kind = %err.kind(),
                error = %err,
                "command rejected"
            ),
        }
        outcome
    }

    fn apply(
        &self,
        journal: &mut Journal,
        caller: &Caller,
        command: &Command,
    ) -> Result<CommandOutcome> {
        match command {
            Command::SubmitProject { name, details } => {
                let project_id = self.submit_locked(journal, caller, name.clone(), details.clone());
                Ok(CommandOutcome::ProjectSubmitted { project_id })
            }
            Command::VerifyProject { project_id } => {
                let changed = self.verify_locked(journal, caller, *project_id)?;
                Ok(CommandOutcome::ProjectVerified {
                    project_id: *project_id,
                    changed,
                })
            }
            Command::Mint { to, amount } => {
                let (to, balance) = self.mint_locked(journal, caller, to, *amount)?;
                Ok(CommandOutcome::Minted {
                    to,
                    amount: *amount,
                    balance,
                })
            }
            Command::Burn { amount } => {
                let balance = self.burn_locked(journal, caller, *amount)?;
                Ok(CommandOutcome::Burned {
                    amount: *amount,
                    balance,
                })
            }
            Command::Transfer { to, amount } => {
                let (to, balance) = self.transfer_locked(journal, caller, to, *amount)?;
                Ok(CommandOutcome::Transferred {
                    to,
                    amount: *amount,
                    balance,
                })
            }
            Command::Vote { project_id } => self
                .vote_locked(journal, caller, *project_id)
                .map(CommandOutcome::Voted),
        }
    }

    fn submit_locked(
        &self,
        journal: &mut Journal,
        caller: &Caller,
        name: String,
        details: String,
    ) -> ProjectId {
        let project_id = self.registry.submit(caller, name.clone(), details);
        journal.record(caller, AuditAction::ProjectSubmitted { project_id, name });
        project_id
    }

    fn verify_locked(
        &self,
        journal: &mut Journal,
        caller: &Caller,
        project_id: ProjectId,
    ) -> Result<bool> {
        let changed = self.registry.verify_project(caller, project_id)?;
        journal.record(caller, AuditAction::ProjectVerified { project_id, changed });
        Ok(changed)
    }

    fn mint_locked(
        &self,
        journal: &mut Journal,
        caller: &Caller,
        to: &str,
        amount: Amount,
    ) -> Result<(AccountId, Amount)> {
        let to = parse_account(to)?;
        self.ledger.issue(caller, &to, amount)?;
        journal.record(
            caller,
            AuditAction::Minted {
                to: to.clone(),
                amount,
            },
        );
        let balance = self.ledger.balance_of(&to);
        Ok((to, balance))
    }

    fn burn_locked(
        &self,
        journal: &mut Journal,
        caller: &Caller,
        amount: Amount,
    ) -> Result<Amount> {
        self.ledger.destroy(caller, amount)?;
        journal.record(caller, AuditAction::Burned { amount });
        Ok(self.ledger.balance_of(caller.account()))
    }

    fn transfer_locked(
        &self,
        journal: &mut Journal,
        caller: &Caller,
        to: &str,
        amount: Amount,
    ) -> Result<(AccountId, Amount)> {
        let to = parse_account(to)?;
        self.ledger.transfer(caller, &to, amount)?;
        journal.record(
            caller,
            AuditAction::Transferred {
                to: to.clone(),
                amount,
            },
        );
        Ok((to, self.ledger.balance_of(caller.account())))
    }

    fn vote_locked(
        &self,
        journal: &mut Journal,
        caller: &Caller,
        project_id: ProjectId,
    ) -> Result<VoteOutcome> {
        let outcome = self.governance.cast_vote(project_id, caller)?;
        journal.record(
            caller,
            AuditAction::Voted {
                project_id,
                tally: outcome.tally,
                crossed_threshold: outcome.crossed_threshold,
            },
        );
        Ok(outcome)
    }

    //==================== read accessors ====================//

    pub fn balance_of(&self, holder: &AccountId) -> Amount {
        self.ledger.balance_of(holder)
    }

    pub fn total_supply(&self) -> Amount {
        self.ledger.total_supply()
    }

    pub fn projects(&self, project_id: ProjectId) -> Result<ProjectRecord> {
        Ok(self.registry.get(project_id)?)
    }

    pub fn tally(&self, project_id: ProjectId) -> Result<u64> {
        Ok(self.governance.get_tally(project_id)?)
    }

    pub fn has_voted(&self, project_id: ProjectId, voter: &AccountId) -> bool {
        self.governance.has_voted(project_id, voter)
    }

    pub fn next_nonce(&self, account: &AccountId) -> u64 {
        self.journal.lock().next_nonce(account)
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.journal.lock().audit.clone()
    }

    //==================== snapshot / restore ====================//

    pub fn snapshot(&self) -> DeploymentSnapshot {
        let journal = self.journal.lock();
        DeploymentSnapshot {
            admin: self.admin.clone(),
            governance: self.governance.config().clone(),
            ledger: self.ledger.snapshot(),
            ledger_root: hex::encode(self.ledger.state_root()),
            registry: self.registry.snapshot(),
            votes: self.governance.snapshot(),
            nonces: journal.nonces.clone(),
            audit: journal.audit.clone(),
        }
    }

    /// Rebuild a deployment, refusing snapshots that break the ledger or
    /// voting invariants.
    pub fn restore(snapshot: DeploymentSnapshot) -> std::result::Result<Self, StoreError> {
        validate(&snapshot)?;
        let DeploymentSnapshot {
            admin,
            governance,
            ledger,
            registry,
            votes,
            nonces,
            audit,
            ..
        } = snapshot;

        let ledger = Arc::new(Ledger::from_state(admin.clone(), ledger));
        let registry = Arc::new(Registry::from_state(admin.clone(), registry));
        let governance = GovernanceEngine::with_book(
            governance,
            Arc::clone(&ledger),
            Arc::clone(&registry),
            votes,
        );
        Ok(Self {
            admin,
            ledger,
            registry,
            governance,
            journal: Mutex::new(Journal { nonces, audit }),
        })
    }
}

fn validate(snapshot: &DeploymentSnapshot) -> std::result::Result<(), StoreError> {
    let corrupt = |msg: String| -> std::result::Result<(), StoreError> {
        Err(StoreError::Corrupt(msg))
    };

    if parse_account(&snapshot.admin).is_err() {
        return corrupt(format!("admin {:?} is not a valid account", snapshot.admin));
    }
    if !snapshot.ledger.is_consistent() {
        return corrupt("credit supply does not match issued minus destroyed".into());
    }
    if hex::encode(snapshot.ledger.state_root()) != snapshot.ledger_root {
        return corrupt("ledger balances do not match the recorded ledger root".into());
    }

    let registry = &snapshot.registry;
    for (id, record) in &registry.projects {
        if record.id != *id || *id == 0 || *id >= registry.next_id {
            return corrupt(format!("project {id} has an out-of-sequence id"));
        }
    }

    let votes = &snapshot.votes;
    for (project, _) in &votes.receipts {
        if !votes.tallies.contains_key(project) {
            return corrupt(format!("receipt for project {project} has no tally"));
        }
    }
    let quorum = snapshot.governance.quorum();
    for (project, tally) in &votes.tallies {
        let Some(record) = registry.projects.get(project) else {
            return corrupt(format!("tally for unknown project {project}"));
        };
        if votes.receipt_count(*project) != *tally {
            return corrupt(format!("tally for project {project} does not match its receipts"));
        }
        if *tally >= quorum && !record.verified {
            return corrupt(format!("project {project} reached quorum but is not verified"));
        }
    }
    Ok(())
}

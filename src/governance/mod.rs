//! Token-weighted project verification.
//!
//! The engine owns the vote receipts and per-project tallies. It reads voter
//! eligibility from a [`BalanceSource`] and applies verification through a
//! [`ProjectDirectory`]; both are injected at construction and never reached
//! through global state.
//!
//! Every [`GovernanceEngine::cast_vote`] runs under one mutex covering the
//! full check-and-update sequence, so two calls for the same voter and
//! project can never both observe a missing receipt, and exactly one call
//! observes the tally reaching quorum.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{AccountId, Caller};
use crate::config::{GovernanceConfig, PostVerificationPolicy};
use crate::ledger::{Amount, Ledger};
use crate::registry::{ProjectId, Registry};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteError {
    #[error("unknown project {0}")]
    UnknownProject(ProjectId),
    #[error("account {voter} already voted for project {project}")]
    AlreadyVoted { project: ProjectId, voter: AccountId },
    #[error("account {voter} holds no credits and cannot vote")]
    InsufficientBalance { voter: AccountId },
    #[error("project {0} is already verified")]
    AlreadyVerified(ProjectId),
}

/// Read access to voter balances.
pub trait BalanceSource: Send + Sync {
    fn balance_of(&self, holder: &AccountId) -> Amount;
}

/// The registry operations the engine depends on.
pub trait ProjectDirectory: Send + Sync {
    /// `None` when the project was never submitted, otherwise its verified flag.
    fn verification_status(&self, project: ProjectId) -> Option<bool>;

    /// Must be idempotent. `Some(true)` only when the flag actually changed,
    /// `None` when the project is unknown.
    fn mark_verified(&self, project: ProjectId) -> Option<bool>;
}

impl BalanceSource for Ledger {
    fn balance_of(&self, holder: &AccountId) -> Amount {
        Ledger::balance_of(self, holder)
    }
}

impl ProjectDirectory for Registry {
    fn verification_status(&self, project: ProjectId) -> Option<bool> {
        self.is_verified(project)
    }

    fn mark_verified(&self, project: ProjectId) -> Option<bool> {
        Registry::mark_verified(self, project).ok()
    }
}

/// Receipts and tallies.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteBook {
    pub tallies: BTreeMap<ProjectId, u64>,
    pub receipts: BTreeSet<(ProjectId, AccountId)>,
}

impl VoteBook {
    pub fn tally(&self, project: ProjectId) -> u64 {
        self.tallies.get(&project).copied().unwrap_or(0)
    }

    pub fn has_voted(&self, project: ProjectId, voter: &AccountId) -> bool {
        self.receipts.contains(&(project, voter.clone()))
    }

    /// Number of receipts recorded for `project`.
    pub fn receipt_count(&self, project: ProjectId) -> u64 {
        self.receipts
            .range((project, AccountId::new())..)
            .take_while(|(id, _)| *id == project)
            .count() as u64
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteOutcome {
    pub project: ProjectId,
    pub voter: AccountId,
    pub tally: u64,
    /// Whether this vote was the one that verified the project.
    pub crossed_threshold: bool,
}

pub struct GovernanceEngine<L = Ledger, R = Registry> {
    config: GovernanceConfig,
    ledger: Arc<L>,
    registry: Arc<R>,
    book: Mutex<VoteBook>,
}

impl<L, R> GovernanceEngine<L, R>
where
    L: BalanceSource,
    R: ProjectDirectory,
{
    pub fn new(config: GovernanceConfig, ledger: Arc<L>, registry: Arc<R>) -> Self {
        Self::with_book(config, ledger, registry, VoteBook::default())
    }

    pub(crate) fn with_book(
        config: GovernanceConfig,
        ledger: Arc<L>,
        registry: Arc<R>,
        book: VoteBook,
    ) -> Self {
        Self {
            config,
            ledger,
            registry,
            book: Mutex::new(book),
        }
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn quorum(&self) -> u64 {
        self.config.quorum()
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Record one affirmative vote from `voter` on `project`.
    ///
    /// Eligibility is a non-zero balance at the moment of the call; the
    /// balance is observed, never locked or consumed. On any error the
    /// receipts, tallies and registry are exactly as before the call.
    pub fn cast_vote(&self, project: ProjectId, voter: &Caller) -> Result<VoteOutcome, VoteError> {
        let mut book = self.book.lock();

        let verified = self
            .registry
            .verification_status(project)
            .ok_or(VoteError::UnknownProject(project))?;

        let receipt = (project, voter.account().clone());
        if book.receipts.contains(&receipt) {
            warn!(project, voter = %voter, "duplicate vote rejected");
            return Err(VoteError::AlreadyVoted {
                project,
                voter: voter.account().clone(),
            });
        }

        if verified && self.config.post_verification == PostVerificationPolicy::Reject {
            return Err(VoteError::AlreadyVerified(project));
        }

        if self.ledger.balance_of(voter.account()) == 0 {
            return Err(VoteError::InsufficientBalance {
                voter: voter.account().clone(),
            });
        }

        book.receipts.insert(receipt.clone());
        let tally = {
            let entry = book.tallies.entry(project).or_insert(0);
            *entry += 1;
            *entry
        };

        // Receipt and tally are committed before the registry is touched.
        let mut crossed_threshold = false;
        if !verified && tally >= self.config.quorum() {
            match self.registry.mark_verified(project) {
                Some(changed) => crossed_threshold = changed,
                None => {
                    book.receipts.remove(&receipt);
                    if tally == 1 {
                        book.tallies.remove(&project);
                    } else {
                        book.tallies.insert(project, tally - 1);
                    }
                    return Err(VoteError::UnknownProject(project));
                }
            }
        }

        info!(
            initiator = %voter,
            project,
            tally,
            quorum = self.config.quorum(),
            crossed_threshold,
            "vote recorded"
        );
        Ok(VoteOutcome {
            project,
            voter: voter.account().clone(),
            tally,
            crossed_threshold,
        })
    }

    pub fn get_tally(&self, project: ProjectId) -> Result<u64, VoteError> {
        if self.registry.verification_status(project).is_none() {
            return Err(VoteError::UnknownProject(project));
        }
        let tally = self.book.lock().tally(project);
        debug!(project, tally, "tally read");
        Ok(tally)
    }

    pub fn has_voted(&self, project: ProjectId, voter: &AccountId) -> bool {
        self.book.lock().has_voted(project, voter)
    }

    pub fn snapshot(&self) -> VoteBook {
        self.book.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use crate::auth::Identity;

    #[derive(Default)]
    struct FixedBalances(Mutex<HashMap<AccountId, Amount>>);

    impl FixedBalances {
        fn set(&self, holder: &AccountId, amount: Amount) {
            self.0.lock().insert(holder.clone(), amount);
        }
    }

    impl BalanceSource for FixedBalances {
        fn balance_of(&self, holder: &AccountId) -> Amount {
            self.0.lock().get(holder).copied().unwrap_or(0)
        }
    }

    #[derive(Default)]
    struct Projects {
        verified: Mutex<BTreeMap<ProjectId, bool>>,
        mark_calls: Mutex<u32>,
        fail_marks: bool,
    }

    impl Projects {
        fn with(ids: &[ProjectId]) -> Self {
            let projects = Self::default();
            for id in ids {
                projects.verified.lock().insert(*id, false);
            }
            projects
        }
    }

    impl ProjectDirectory for Projects {
        fn verification_status(&self, project: ProjectId) -> Option<bool> {
            self.verified.lock().get(&project).copied()
        }

        fn mark_verified(&self, project: ProjectId) -> Option<bool> {
            *self.mark_calls.lock() += 1;
            if self.fail_marks {
                return None;
            }
            let mut verified = self.verified.lock();
            let flag = verified.get_mut(&project)?;
            let changed = !*flag;
            *flag = true;
            Some(changed)
        }
    }

    fn engine(
        quorum: u64,
        projects: Projects,
    ) -> (GovernanceEngine<FixedBalances, Projects>, Arc<FixedBalances>) {
        let balances = Arc::new(FixedBalances::default());
        let engine = GovernanceEngine::new(
            GovernanceConfig::with_quorum(quorum).unwrap(),
            balances.clone(),
            Arc::new(projects),
        );
        (engine, balances)
    }

    fn funded_voters(balances: &FixedBalances, n: usize) -> Vec<Identity> {
        (0..n)
            .map(|_| {
                let id = Identity::generate();
                balances.set(&id.account_id(), 100);
                id
            })
            .collect()
    }

    #[test]
    fn quorum_vote_verifies_exactly_once() {
        let (engine, balances) = engine(3, Projects::with(&[1]));
        let voters = funded_voters(&balances, 4);

        let first = engine.cast_vote(1, &voters[0].caller()).unwrap();
        assert_eq!((first.tally, first.crossed_threshold), (1, false));
        engine.cast_vote(1, &voters[1].caller()).unwrap();
        assert_eq!(engine.registry().verification_status(1), Some(false));

        let third = engine.cast_vote(1, &voters[2].caller()).unwrap();
        assert_eq!((third.tally, third.crossed_threshold), (3, true));
        assert_eq!(engine.registry().verification_status(1), Some(true));

        let late = engine.cast_vote(1, &voters[3].caller()).unwrap();
        assert_eq!((late.tally, late.crossed_threshold), (4, false));
        assert_eq!(*engine.registry().mark_calls.lock(), 1);
    }

    #[test]
    fn duplicate_vote_is_rejected_before_eligibility() {
        let (engine, balances) = engine(3, Projects::with(&[1]));
        let voter = &funded_voters(&balances, 1)[0];
        engine.cast_vote(1, &voter.caller()).unwrap();

        balances.set(&voter.account_id(), 0);
        assert_eq!(
            engine.cast_vote(1, &voter.caller()),
            Err(VoteError::AlreadyVoted {
                project: 1,
                voter: voter.account_id()
            })
        );
        assert_eq!(engine.get_tally(1), Ok(1));
    }

    #[test]
    fn zero_balance_is_ineligible() {
        let (engine, balances) = engine(3, Projects::with(&[1]));
        let voter = Identity::generate();
        assert_eq!(
            engine.cast_vote(1, &voter.caller()),
            Err(VoteError::InsufficientBalance {
                voter: voter.account_id()
            })
        );
        assert!(!engine.has_voted(1, &voter.account_id()));

        balances.set(&voter.account_id(), 1);
        assert_eq!(engine.cast_vote(1, &voter.caller()).unwrap().tally, 1);
    }

    #[test]
    fn unknown_project_creates_nothing() {
        let (engine, balances) = engine(3, Projects::with(&[1]));
        let voter = &funded_voters(&balances, 1)[0];
        assert_eq!(
            engine.cast_vote(999, &voter.caller()),
            Err(VoteError::UnknownProject(999))
        );
        assert_eq!(engine.get_tally(999), Err(VoteError::UnknownProject(999)));
        assert_eq!(engine.snapshot(), VoteBook::default());
    }

    #[test]
    fn reject_policy_refuses_votes_on_verified_projects() {
        let projects = Projects::with(&[1]);
        projects.verified.lock().insert(1, true);
        let balances = Arc::new(FixedBalances::default());
        let engine = GovernanceEngine::new(
            GovernanceConfig::with_quorum(3)
                .unwrap()
                .post_verification(PostVerificationPolicy::Reject),
            balances.clone(),
            Arc::new(projects),
        );
        let voter = &funded_voters(&balances, 1)[0];
        assert_eq!(
            engine.cast_vote(1, &voter.caller()),
            Err(VoteError::AlreadyVerified(1))
        );
        assert_eq!(engine.get_tally(1), Ok(0));
    }

    #[test]
    fn registry_failure_rolls_back_the_vote() {
        let mut projects = Projects::with(&[1]);
        projects.fail_marks = true;
        let (engine, balances) = engine(1, projects);
        let voter = &funded_voters(&balances, 1)[0];

        assert_eq!(
            engine.cast_vote(1, &voter.caller()),
            Err(VoteError::UnknownProject(1))
        );
        assert!(!engine.has_voted(1, &voter.account_id()));
        assert_eq!(engine.snapshot(), VoteBook::default());
    }

    #[test]
    fn receipt_count_is_per_project() {
        let mut book = VoteBook::default();
        book.receipts.insert((1, "a".into()));
        book.receipts.insert((2, "a".into()));
        book.receipts.insert((2, "b".into()));
        book.receipts.insert((3, "c".into()));
        assert_eq!(book.receipt_count(1), 1);
        assert_eq!(book.receipt_count(2), 2);
        assert_eq!(book.receipt_count(4), 0);
    }
}

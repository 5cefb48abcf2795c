use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::{AccountId, Caller};

pub type ProjectId = u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown project {0}")]
    UnknownProject(ProjectId),
    #[error("account {account} is not allowed to verify projects")]
    Unauthorized { account: AccountId },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub name: String,
    pub details: String,
    pub submitter: AccountId,
    pub verified: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryState {
    pub next_id: ProjectId,
    pub projects: BTreeMap<ProjectId, ProjectRecord>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            next_id: 1,
            projects: BTreeMap::new(),
        }
    }
}

impl RegistryState {
    pub fn submit(&mut self, name: String, details: String, submitter: AccountId) -> ProjectId {
        let id = self.next_id;
        self.next_id += 1;
        self.projects.insert(
            id,
            ProjectRecord {
                id,
                name,
                details,
                submitter,
                verified: false,
            },
        );
        id
    }

    /// Returns `true` when this call flipped the flag.
    pub fn mark_verified(&mut self, id: ProjectId) -> Result<bool, RegistryError> {
        let record = self
            .projects
            .get_mut(&id)
            .ok_or(RegistryError::UnknownProject(id))?;
        let changed = !record.verified;
        record.verified = true;
        Ok(changed)
    }
}

/// Project records. `verified` only ever moves from `false` to `true`.
#[derive(Debug)]
pub struct Registry {
    admin: AccountId,
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new(admin: &Caller) -> Self {
        Self::from_state(admin.account().clone(), RegistryState::default())
    }

    pub(crate) fn from_state(admin: AccountId, state: RegistryState) -> Self {
        Self {
            admin,
            state: RwLock::new(state),
        }
    }

    pub fn admin(&self) -> &AccountId {
        &self.admin
    }

    pub fn submit(&self, caller: &Caller, name: String, details: String) -> ProjectId {
        let id = self
            .state
            .write()
            .submit(name.clone(), details, caller.account().clone());
        info!(initiator = %caller, project = id, name = %name, "project submitted");
        id
    }

    pub fn get(&self, id: ProjectId) -> Result<ProjectRecord, RegistryError> {
        self.state
            .read()
            .projects
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownProject(id))
    }

    /// `None` if the project was never submitted, otherwise its flag.
    pub fn is_verified(&self, id: ProjectId) -> Option<bool> {
        self.state.read().projects.get(&id).map(|record| record.verified)
    }

    /// Idempotent: marking an already verified project is a no-op.
    pub fn mark_verified(&self, id: ProjectId) -> Result<bool, RegistryError> {
        let changed = self.state.write().mark_verified(id)?;
        if changed {
            info!(project = id, "project verified");
        } else {
            debug!(project = id, "project already verified");
        }
        Ok(changed)
    }

    /// Administrative override that verifies a project without a vote.
    pub fn verify_project(&self, caller: &Caller, id: ProjectId) -> Result<bool, RegistryError> {
        if caller.account() != &self.admin {
            return Err(RegistryError::Unauthorized {
                account: caller.account().clone(),
            });
        }
        let changed = self.mark_verified(id)?;
        info!(initiator = %caller, project = id, changed, "administrative verification");
        Ok(changed)
    }

    pub fn project_count(&self) -> usize {
        self.state.read().projects.len()
    }

    pub fn snapshot(&self) -> RegistryState {
        self.state.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;

    #[test]
    fn ids_are_sequential_from_one() {
        let admin = Identity::generate();
        let registry = Registry::new(&admin.caller());
        let first = registry.submit(&admin.caller(), "Project 1".into(), "Details 1".into());
        let second = registry.submit(&admin.caller(), "Project 2".into(), "Details 2".into());
        assert_eq!((first, second), (1, 2));

        let record = registry.get(1).unwrap();
        assert_eq!(record.name, "Project 1");
        assert_eq!(record.details, "Details 1");
        assert_eq!(record.submitter, admin.account_id());
        assert!(!record.verified);
        assert_eq!(registry.get(3), Err(RegistryError::UnknownProject(3)));
    }

    #[test]
    fn mark_verified_is_idempotent() {
        let admin = Identity::generate();
        let registry = Registry::new(&admin.caller());
        let id = registry.submit(&admin.caller(), "Alpha".into(), String::new());
        assert_eq!(registry.mark_verified(id), Ok(true));
        assert_eq!(registry.mark_verified(id), Ok(false));
        assert_eq!(registry.is_verified(id), Some(true));
        assert_eq!(registry.is_verified(99), None);
        assert_eq!(
            registry.mark_verified(99),
            Err(RegistryError::UnknownProject(99))
        );
    }

    #[test]
    fn direct_verification_requires_admin() {
        let admin = Identity::generate();
        let user = Identity::generate();
        let registry = Registry::new(&admin.caller());
        let id = registry.submit(&user.caller(), "Project 2".into(), "Details 2".into());

        assert_eq!(
            registry.verify_project(&user.caller(), id),
            Err(RegistryError::Unauthorized {
                account: user.account_id()
            })
        );
        assert!(!registry.get(id).unwrap().verified);

        assert_eq!(registry.verify_project(&admin.caller(), id), Ok(true));
        assert_eq!(registry.verify_project(&admin.caller(), id), Ok(false));
        assert!(registry.get(id).unwrap().verified);
    }
}

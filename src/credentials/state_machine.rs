//! Space membership state
//!
//! `SpaceStateMachine` folds the credentials of a space's control feeds into
//! the set of admitted members and feeds. `SpaceState` shares one machine
//! between the control pipeline and the auth verifier.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use super::{Assertion, Credential, CredentialError, Designation, MemberRole};
use crate::keys::PublicKey;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub key: PublicKey,
    pub role: MemberRole,
    pub genesis_feed_key: PublicKey,
    pub credential: Credential,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedInfo {
    pub key: PublicKey,
    pub identity_key: PublicKey,
    pub device_key: PublicKey,
    pub designation: Designation,
    /// Feed the admitting credential was read from.
    pub admitted_on: PublicKey,
    pub credential: Credential,
}

/// State change caused by a credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpaceEvent {
    MemberAdmitted(MemberInfo),
    FeedAdmitted(FeedInfo),
}

#[derive(Debug)]
pub struct SpaceStateMachine {
    space_key: PublicKey,
    genesis: Option<Credential>,
    members: BTreeMap<PublicKey, MemberInfo>,
    feeds: BTreeMap<PublicKey, FeedInfo>,
    processed: usize,
}

impl SpaceStateMachine {
    pub fn new(space_key: PublicKey) -> Self {
        Self {
            space_key,
            genesis: None,
            members: BTreeMap::new(),
            feeds: BTreeMap::new(),
            processed: 0,
        }
    }

    pub fn space_key(&self) -> PublicKey {
        self.space_key
    }

    pub fn has_genesis(&self) -> bool {
        self.genesis.is_some()
    }

    pub fn member(&self, key: &PublicKey) -> Option<&MemberInfo> {
        self.members.get(key)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberInfo> {
        self.members.values()
    }

    pub fn feed(&self, key: &PublicKey) -> Option<&FeedInfo> {
        self.feeds.get(key)
    }

    pub fn feeds(&self) -> impl Iterator<Item = &FeedInfo> {
        self.feeds.values()
    }

    /// Whether `key` is a member or the device key of an admitted feed.
    pub fn is_admitted(&self, key: &PublicKey) -> bool {
        self.members.contains_key(key) || self.feeds.values().any(|f| f.device_key == *key)
    }

    /// Number of credentials accepted so far.
    pub fn processed(&self) -> usize {
        self.processed
    }

    fn is_authority(&self, key: &PublicKey) -> bool {
        *key == self.space_key
    }

    /// Apply a credential read from `feed_key`.
    ///
    /// Valid credentials that change nothing (repeated admissions) are
    /// accepted and produce no events.
    pub fn process(&mut self, credential: &Credential, feed_key: PublicKey) -> Result<Vec<SpaceEvent>, CredentialError> {
        credential.verify()?;

        let space_key = *credential.assertion.space_key();
        if space_key != self.space_key {
            return Err(CredentialError::WrongSpace {
                expected: self.space_key,
                got: space_key,
            });
        }

        if self.genesis.is_none() && !matches!(credential.assertion, Assertion::SpaceGenesis { .. }) {
            return Err(CredentialError::MissingGenesis(credential.assertion.kind().to_string()));
        }

        let events = match &credential.assertion {
            Assertion::SpaceGenesis { .. } => {
                if !self.is_authority(&credential.issuer) || credential.subject != self.space_key {
                    return Err(CredentialError::Unauthorized(
                        "genesis must be self-signed by the space key".into(),
                    ));
                }
                if self.genesis.is_none() {
                    self.genesis = Some(credential.clone());
                }
                Vec::new()
            }

            Assertion::SpaceMember {
                role,
                genesis_feed_key,
                ..
            } => {
                let issuer_may_admit = self.is_authority(&credential.issuer)
                    || self
                        .members
                        .get(&credential.issuer)
                        .is_some_and(|m| m.role.can_admit_members());
                if !issuer_may_admit {
                    return Err(CredentialError::Unauthorized(format!(
                        "{} may not admit members",
                        credential.issuer.truncate()
                    )));
                }
                if self.members.contains_key(&credential.subject) {
                    Vec::new()
                } else {
                    let info = MemberInfo {
                        key: credential.subject,
                        role: *role,
                        genesis_feed_key: *genesis_feed_key,
                        credential: credential.clone(),
                    };
                    self.members.insert(info.key, info.clone());
                    vec![SpaceEvent::MemberAdmitted(info)]
                }
            }

            Assertion::AdmittedFeed {
                identity_key,
                device_key,
                designation,
                ..
            } => {
                if !self.is_authority(&credential.issuer) && !self.members.contains_key(&credential.issuer) {
                    return Err(CredentialError::Unauthorized(format!(
                        "{} may not admit feeds",
                        credential.issuer.truncate()
                    )));
                }
                if !self.members.contains_key(identity_key) {
                    return Err(CredentialError::NotMember(*identity_key));
                }
                if self.feeds.contains_key(&credential.subject) {
                    Vec::new()
                } else {
                    let info = FeedInfo {
                        key: credential.subject,
                        identity_key: *identity_key,
                        device_key: *device_key,
                        designation: *designation,
                        admitted_on: feed_key,
                        credential: credential.clone(),
                    };
                    self.feeds.insert(info.key, info.clone());
                    vec![SpaceEvent::FeedAdmitted(info)]
                }
            }

            Assertion::Auth { .. } => {
                return Err(CredentialError::Unauthorized(
                    "auth credentials cannot be written to a space".into(),
                ));
            }
        };

        self.processed += 1;
        Ok(events)
    }
}

struct Shared {
    machine: Mutex<SpaceStateMachine>,
    revision: watch::Sender<u64>,
}

/// Shared handle to a space's membership state.
#[derive(Clone)]
pub struct SpaceState {
    shared: Arc<Shared>,
}

impl SpaceState {
    pub fn new(space_key: PublicKey) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                machine: Mutex::new(SpaceStateMachine::new(space_key)),
                revision,
            }),
        }
    }

    /// Run `f` with the machine locked.
    pub fn read<R>(&self, f: impl FnOnce(&SpaceStateMachine) -> R) -> R {
        let machine = self
            .shared
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&machine)
    }

    pub fn process(&self, credential: &Credential, feed_key: PublicKey) -> Result<Vec<SpaceEvent>, CredentialError> {
        let events = {
            let mut machine = self
                .shared
                .machine
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            machine.process(credential, feed_key)?
        };
        self.shared.revision.send_modify(|r| *r += 1);
        Ok(events)
    }

    pub fn space_key(&self) -> PublicKey {
        self.read(|m| m.space_key())
    }

    pub fn is_admitted(&self, key: &PublicKey) -> bool {
        self.read(|m| m.is_admitted(key))
    }

    pub fn feed(&self, key: &PublicKey) -> Option<FeedInfo> {
        self.read(|m| m.feed(key).cloned())
    }

    pub fn feeds(&self) -> Vec<FeedInfo> {
        self.read(|m| m.feeds().cloned().collect())
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.read(|m| m.members().cloned().collect())
    }

    /// Receiver that changes whenever a credential is accepted.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }
}

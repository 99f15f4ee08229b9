//! Match Coordinator: mate relations and mate requests across two user
//! records.
//!
//! Each operation touches two documents with independent updates. Operations
//! on the same unordered pair of users are serialized through [`PairLocks`],
//! so two concurrent `match` calls for one pair cannot both pass the
//! "not yet matched" check. `unmatch` still removes every entry referencing
//! the other party, which also cleans up duplicates written before the lock
//! existed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use sketchmate_shared::{Mate, User, UserId, UserUpdate};

use crate::error::ServerError;
use crate::persistence::Persistence;

type PairKey = (UserId, UserId);
type LockTable = Mutex<HashMap<PairKey, Arc<AsyncMutex<()>>>>;

/// One async lock per unordered pair of users, created on demand and dropped
/// once nobody holds or waits for it.
#[derive(Default)]
pub struct PairLocks {
    table: Arc<LockTable>,
}

pub struct PairGuard {
    key: PairKey,
    table: Arc<LockTable>,
    _held: OwnedMutexGuard<()>,
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the table, one inside `_held`.
        if table
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            table.remove(&self.key);
        }
    }
}

impl PairLocks {
    fn key(a: &UserId, b: &UserId) -> PairKey {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    pub async fn acquire(&self, a: &UserId, b: &UserId) -> PairGuard {
        let key = Self::key(a, b);
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.entry(key.clone()).or_default().clone()
        };
        PairGuard {
            key,
            table: self.table.clone(),
            _held: lock.lock_owned().await,
        }
    }

    pub fn active_pairs(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Both updated records after a successful match.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub user: User,
    pub mate: User,
}

/// Caller's record after an unmatch. `removed` is false when neither side
/// referenced the other.
#[derive(Debug, Clone)]
pub struct UnmatchOutcome {
    pub user: User,
    pub removed: bool,
}

/// Both records after a mate-request transition. `issuer` is the user who
/// sent the event.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub issuer: User,
    pub counterpart: User,
}

/// A profile change and the mates whose stored projection was refreshed.
#[derive(Debug, Clone)]
pub struct ProfileOutcome {
    pub user: User,
    pub refreshed: Vec<UserId>,
}

pub struct MatchCoordinator {
    store: Arc<dyn Persistence>,
    locks: PairLocks,
}

impl MatchCoordinator {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self {
            store,
            locks: PairLocks::default(),
        }
    }

    pub fn locks(&self) -> &PairLocks {
        &self.locks
    }

    pub async fn match_users(
        &self,
        user_id: &UserId,
        mate_id: &UserId,
    ) -> Result<MatchOutcome, ServerError> {
        if user_id == mate_id {
            return Err(ServerError::SelfMatch);
        }
        let _pair = self.locks.acquire(user_id, mate_id).await;

        let user = self.store.get_user(user_id).await?;
        let mate = self.store.get_user(mate_id).await?;
        if user.has_mate(mate_id) || mate.has_mate(user_id) {
            return Err(ServerError::AlreadyMatched);
        }

        let user = self
            .store
            .update_user(
                user_id,
                vec![
                    UserUpdate::AddMate(mate.projection()),
                    UserUpdate::ClearMateRequests(mate_id.clone()),
                ],
            )
            .await?;
        let mate = self
            .store
            .update_user(
                mate_id,
                vec![
                    UserUpdate::AddMate(user.projection()),
                    UserUpdate::ClearMateRequests(user_id.clone()),
                ],
            )
            .await?;

        info!(user = %user_id, mate = %mate_id, "Matched");
        Ok(MatchOutcome { user, mate })
    }

    /// Remove the relation on both sides. Repeating it is a no-op, and a
    /// missing mate record is tolerated.
    pub async fn unmatch(
        &self,
        user_id: &UserId,
        mate_id: &UserId,
    ) -> Result<UnmatchOutcome, ServerError> {
        let _pair = self.locks.acquire(user_id, mate_id).await;

        let had_mate = self.store.get_user(user_id).await?.has_mate(mate_id);
        let mate_had_user = self
            .store
            .find_user(mate_id)
            .await?
            .is_some_and(|mate| mate.has_mate(user_id));

        let user = self
            .store
            .update_user(user_id, vec![UserUpdate::RemoveMate(mate_id.clone())])
            .await?;
        match self
            .store
            .update_user(mate_id, vec![UserUpdate::RemoveMate(user_id.clone())])
            .await
        {
            Ok(_) => {}
            Err(ServerError::UserNotFound(_)) => {
                debug!(mate = %mate_id, "Unmatched user no longer exists");
            }
            Err(e) => return Err(e),
        }

        let removed = had_mate || mate_had_user;
        if removed {
            info!(user = %user_id, mate = %mate_id, "Unmatched");
        } else {
            debug!(user = %user_id, mate = %mate_id, "Unmatch on absent relation");
        }
        Ok(UnmatchOutcome { user, removed })
    }

    pub async fn send_mate_request(
        &self,
        sender: &UserId,
        receiver: &UserId,
    ) -> Result<RequestOutcome, ServerError> {
        if sender == receiver {
            return Err(ServerError::SelfMatch);
        }
        let _pair = self.locks.acquire(sender, receiver).await;

        let current = self.store.get_user(sender).await?;
        if current.has_mate(receiver) {
            return Err(ServerError::AlreadyMatched);
        }
        self.store.get_user(receiver).await?;

        let issuer = self
            .store
            .update_user(sender, vec![UserUpdate::AddSentRequest(receiver.clone())])
            .await?;
        let counterpart = self
            .store
            .update_user(receiver, vec![UserUpdate::AddReceivedRequest(sender.clone())])
            .await?;

        debug!(sender = %sender, receiver = %receiver, "Mate request sent");
        Ok(RequestOutcome {
            issuer,
            counterpart,
        })
    }

    /// The requester withdraws its request.
    pub async fn cancel_mate_request(
        &self,
        sender: &UserId,
        receiver: &UserId,
    ) -> Result<RequestOutcome, ServerError> {
        let _pair = self.locks.acquire(sender, receiver).await;

        let issuer = self
            .store
            .update_user(sender, vec![UserUpdate::RemoveSentRequest(receiver.clone())])
            .await?;
        let counterpart = self
            .store
            .update_user(receiver, vec![UserUpdate::RemoveReceivedRequest(sender.clone())])
            .await?;

        debug!(sender = %sender, receiver = %receiver, "Mate request cancelled");
        Ok(RequestOutcome {
            issuer,
            counterpart,
        })
    }

    /// `refuser` declines the request it received from `requester`.
    pub async fn refuse_mate_request(
        &self,
        refuser: &UserId,
        requester: &UserId,
    ) -> Result<RequestOutcome, ServerError> {
        let _pair = self.locks.acquire(refuser, requester).await;

        let issuer = self
            .store
            .update_user(
                refuser,
                vec![UserUpdate::RemoveReceivedRequest(requester.clone())],
            )
            .await?;
        let counterpart = self
            .store
            .update_user(requester, vec![UserUpdate::RemoveSentRequest(refuser.clone())])
            .await?;

        debug!(refuser = %refuser, requester = %requester, "Mate request refused");
        Ok(RequestOutcome {
            issuer,
            counterpart,
        })
    }

    pub async fn rename(&self, user_id: &UserId, name: &str) -> Result<ProfileOutcome, ServerError> {
        let user = self
            .store
            .update_user(user_id, vec![UserUpdate::SetName(name.to_string())])
            .await?;
        let refreshed = self
            .propagate(&user, |mate| UserUpdate::SetMateName {
                mate,
                name: name.to_string(),
            })
            .await;
        Ok(ProfileOutcome { user, refreshed })
    }

    pub async fn change_avatar(
        &self,
        user_id: &UserId,
        img: &str,
    ) -> Result<ProfileOutcome, ServerError> {
        let user = self
            .store
            .update_user(user_id, vec![UserUpdate::SetImg(img.to_string())])
            .await?;
        let refreshed = self
            .propagate(&user, |mate| UserUpdate::SetMateImg {
                mate,
                img: img.to_string(),
            })
            .await;
        Ok(ProfileOutcome { user, refreshed })
    }

    /// Rewrite the projection of `user` stored by each of its mates. Mates
    /// that no longer list `user` are left alone; per-mate failures are
    /// logged.
    async fn propagate(
        &self,
        user: &User,
        update: impl Fn(UserId) -> UserUpdate,
    ) -> Vec<UserId> {
        let mut refreshed = Vec::new();
        let mate_ids: Vec<UserId> = user.mates.iter().map(|m: &Mate| m.id.clone()).collect();

        for mate_id in mate_ids {
            let still_linked = match self.store.find_user(&mate_id).await {
                Ok(Some(mate)) => mate.has_mate(&user.id),
                Ok(None) => false,
                Err(e) => {
                    warn!(user = %user.id, mate = %mate_id, error = %e, "Cannot load mate for profile refresh");
                    false
                }
            };
            if !still_linked || refreshed.contains(&mate_id) {
                continue;
            }
            match self
                .store
                .update_user(&mate_id, vec![update(user.id.clone())])
                .await
            {
                Ok(_) => refreshed.push(mate_id),
                Err(e) => {
                    warn!(user = %user.id, mate = %mate_id, error = %e, "Profile refresh failed");
                }
            }
        }

        debug!(user = %user.id, mates = refreshed.len(), "Profile projection refreshed");
        refreshed
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Mutex, MutexGuard, PoisonError,
};

use chrono::{DateTime, Utc};

use crate::model::{
    common::{InvitationStatus, StatusCounts},
    db::{Ballot, Candidate, Election, Invitation, NewBallot, NewInvitation},
    mongodb::Id,
};

use super::{BallotLedger, ElectionDirectory, InvitationStore, Result, StoreError};

/// A [`VotingStore`](super::VotingStore) held entirely in memory, for tests.
///
/// All tables sit behind one lock, which is never held across an `.await`, so
/// every operation is atomic with respect to every other. The same uniqueness
/// rules as the MongoDB indexes are enforced by hand.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Number of upcoming ballot commits that should fail transiently.
    failing_commits: AtomicU32,
    /// Whether the next ballot commit finds its invitation already expired.
    expire_on_commit: AtomicBool,
}

#[derive(Default)]
struct Tables {
    elections: HashMap<Id, Election>,
    candidates: HashMap<Id, Candidate>,
    invitations: HashMap<Id, Invitation>,
    /// token -> invitation ID
    tokens: HashMap<String, Id>,
    /// (election ID, voter ID) -> invitation ID
    invited: HashMap<(Id, Id), Id>,
    ballots: HashMap<Id, Ballot>,
    /// (election ID, voter ID) pairs holding a ballot.
    voted: HashSet<(Id, Id)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an election, as the election administration would.
    pub fn insert_election(&self, election: Election) {
        self.lock().elections.insert(election.id, election);
    }

    /// Register a candidate, as the election administration would.
    pub fn insert_candidate(&self, candidate: Candidate) {
        self.lock().candidates.insert(candidate.id, candidate);
    }

    /// Make the next `count` ballot commits fail with a transient error before
    /// touching any data.
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Let the expiry sweep win the race against the next ballot commit: the
    /// commit finds its invitation expired, as if the sweep ran just before it.
    pub fn expire_during_next_commit(&self) {
        self.expire_on_commit.store(true, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A panic while holding the lock cannot leave the tables half-updated,
        // since every write path validates before mutating.
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[rocket::async_trait]
impl ElectionDirectory for MemoryStore {
    async fn election(&self, election_id: Id) -> Result<Option<Election>> {
        Ok(self.lock().elections.get(&election_id).cloned())
    }

    async fn candidate(&self, candidate_id: Id) -> Result<Option<Candidate>> {
        Ok(self.lock().candidates.get(&candidate_id).cloned())
    }

    async fn candidates_for(&self, election_id: Id) -> Result<Vec<Candidate>> {
        let mut candidates: Vec<_> = self
            .lock()
            .candidates
            .values()
            .filter(|c| c.election_id == election_id)
            .cloned()
            .collect();
        candidates.sort_by_key(|c| c.id);
        Ok(candidates)
    }
}

#[rocket::async_trait]
impl InvitationStore for MemoryStore {
    async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>> {
        let tables = self.lock();
        Ok(tables
            .tokens
            .get(token)
            .and_then(|id| tables.invitations.get(id))
            .cloned())
    }

    async fn find_by_election_and_voter(
        &self,
        election_id: Id,
        voter_id: Id,
    ) -> Result<Option<Invitation>> {
        let tables = self.lock();
        Ok(tables
            .invited
            .get(&(election_id, voter_id))
            .and_then(|id| tables.invitations.get(id))
            .cloned())
    }

    async fn invited_voters(&self, election_id: Id) -> Result<HashSet<Id>> {
        Ok(self
            .lock()
            .invited
            .keys()
            .filter(|(election, _)| *election == election_id)
            .map(|(_, voter)| *voter)
            .collect())
    }

    async fn create_many(&self, invitations: Vec<NewInvitation>) -> Result<u64> {
        let mut tables = self.lock();

        // Check every uniqueness constraint before writing anything.
        let mut tokens = HashSet::new();
        let mut pairs = HashSet::new();
        for invitation in &invitations {
            let pair = (invitation.election_id, invitation.voter_id);
            if tables.tokens.contains_key(invitation.token.as_str())
                || tables.invited.contains_key(&pair)
                || !tokens.insert(invitation.token.as_str())
                || !pairs.insert(pair)
            {
                return Err(StoreError::DuplicateInvitation);
            }
        }

        let count = invitations.len() as u64;
        for invitation in invitations {
            let id = Id::new();
            tables.tokens.insert(invitation.token.to_string(), id);
            tables
                .invited
                .insert((invitation.election_id, invitation.voter_id), id);
            tables.invitations.insert(id, Invitation { id, invitation });
        }
        Ok(count)
    }

    async fn pending_for_batch(
        &self,
        election_id: Id,
        batch_number: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invitation>> {
        let mut pending: Vec<_> = self
            .lock()
            .invitations
            .values()
            .filter(|i| {
                i.election_id == election_id
                    && i.batch_number == batch_number
                    && i.status == InvitationStatus::Pending
                    && !i.is_overdue(now)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|i| i.id);
        Ok(pending)
    }

    async fn next_pending_batch(
        &self,
        election_id: Id,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        Ok(self
            .lock()
            .invitations
            .values()
            .filter(|i| {
                i.election_id == election_id
                    && i.status == InvitationStatus::Pending
                    && !i.is_overdue(now)
            })
            .map(|i| i.batch_number)
            .min())
    }

    async fn mark_notified(&self, ids: &[Id], at: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.lock();
        let mut updated = 0;
        for id in ids {
            if let Some(invitation) = tables.invitations.get_mut(id) {
                if invitation.status == InvitationStatus::Pending {
                    invitation.status = InvitationStatus::Notified;
                    invitation.notified_at = Some(at);
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn mark_expired(&self, id: Id) -> Result<bool> {
        let mut tables = self.lock();
        match tables.invitations.get_mut(&id) {
            Some(invitation) if invitation.status.is_open() => {
                invitation.status = InvitationStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.lock();
        let mut expired = 0;
        for invitation in tables.invitations.values_mut() {
            if invitation.status.is_open() && invitation.is_overdue(now) {
                invitation.status = InvitationStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn status_counts(&self, election_id: Id) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for invitation in self.lock().invitations.values() {
            if invitation.election_id == election_id {
                counts.record(invitation.status, 1);
            }
        }
        Ok(counts)
    }
}

#[rocket::async_trait]
impl BallotLedger for MemoryStore {
    async fn commit_ballot_atomic(
        &self,
        invitation: &Invitation,
        candidate_id: Id,
        cast_at: DateTime<Utc>,
    ) -> Result<Ballot> {
        if self.take_injected_failure() {
            return Err(StoreError::Transient("injected failure".to_string()));
        }

        let mut tables = self.lock();
        let election_id = invitation.election_id;
        let voter_id = invitation.voter_id;
        if self.expire_on_commit.swap(false, Ordering::SeqCst) {
            if let Some(stored) = tables.invitations.get_mut(&invitation.id) {
                if stored.status.is_open() {
                    stored.status = InvitationStatus::Expired;
                }
            }
        }

        // Same order of checks as the MongoDB transaction.
        if tables.voted.contains(&(election_id, voter_id)) {
            return Err(StoreError::DuplicateBallot {
                election: election_id,
                voter: voter_id,
            });
        }
        let open = tables
            .invitations
            .get(&invitation.id)
            .map(|stored| stored.status.is_open())
            .unwrap_or(false);
        if !open {
            return Err(StoreError::InvitationClosed(invitation.id));
        }
        let belongs = tables
            .candidates
            .get(&candidate_id)
            .map(|candidate| candidate.election_id == election_id)
            .unwrap_or(false);
        if !belongs {
            return Err(StoreError::CandidateMissing(candidate_id));
        }

        // All checks passed; apply the three writes together.
        let ballot = Ballot {
            id: Id::new(),
            ballot: NewBallot {
                election_id,
                voter_id,
                candidate_id,
                cast_at,
            },
        };
        tables.voted.insert((election_id, voter_id));
        tables.ballots.insert(ballot.id, ballot.clone());
        if let Some(stored) = tables.invitations.get_mut(&invitation.id) {
            stored.status = InvitationStatus::Voted;
        }
        if let Some(candidate) = tables.candidates.get_mut(&candidate_id) {
            candidate.vote_count += 1;
        }
        Ok(ballot)
    }

    async fn ballot_count(&self, election_id: Id) -> Result<u64> {
        Ok(self
            .lock()
            .ballots
            .values()
            .filter(|b| b.election_id == election_id)
            .count() as u64)
    }

    async fn recount(&self, election_id: Id) -> Result<HashMap<Id, u64>> {
        let mut totals = HashMap::new();
        for ballot in self.lock().ballots.values() {
            if ballot.election_id == election_id {
                *totals.entry(ballot.candidate_id).or_insert(0) += 1;
            }
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn seeded() -> (MemoryStore, Election, Candidate) {
        let store = MemoryStore::new();
        let election = Election::active_example();
        let candidate = Candidate::example(election.id, "Ada");
        store.insert_election(election.clone());
        store.insert_candidate(candidate.clone());
        (store, election, candidate)
    }

    async fn invite(store: &MemoryStore, invitation: NewInvitation) -> Invitation {
        let token = invitation.token.clone();
        store.create_many(vec![invitation]).await.unwrap();
        store.find_by_token(&token).await.unwrap().unwrap()
    }

    #[rocket::async_test]
    async fn commit_applies_all_three_writes() {
        let (store, election, candidate) = seeded();
        let invitation = invite(&store, NewInvitation::example(election.id, Id::new())).await;

        let ballot = store
            .commit_ballot_atomic(&invitation, candidate.id, Utc::now())
            .await
            .unwrap();

        assert_eq!(ballot.candidate_id, candidate.id);
        let stored = store.find_by_token(&invitation.token).await.unwrap().unwrap();
        assert_eq!(stored.status, InvitationStatus::Voted);
        let tallied = store.candidate(candidate.id).await.unwrap().unwrap();
        assert_eq!(tallied.vote_count, 1);
        assert_eq!(store.ballot_count(election.id).await.unwrap(), 1);
        assert_eq!(store.recount(election.id).await.unwrap()[&candidate.id], 1);
    }

    #[rocket::async_test]
    async fn second_commit_for_voter_is_a_duplicate() {
        let (store, election, candidate) = seeded();
        let invitation = invite(&store, NewInvitation::example(election.id, Id::new())).await;

        store
            .commit_ballot_atomic(&invitation, candidate.id, Utc::now())
            .await
            .unwrap();
        let err = store
            .commit_ballot_atomic(&invitation, candidate.id, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::DuplicateBallot { .. }));
        assert!(!err.is_retryable());
        let tallied = store.candidate(candidate.id).await.unwrap().unwrap();
        assert_eq!(tallied.vote_count, 1);
    }

    #[rocket::async_test]
    async fn failed_commit_leaves_no_trace() {
        let (store, election, _) = seeded();
        let other = Election::active_example();
        let foreign = Candidate::example(other.id, "Grace");
        store.insert_candidate(foreign.clone());
        let invitation = invite(&store, NewInvitation::example(election.id, Id::new())).await;

        let err = store
            .commit_ballot_atomic(&invitation, foreign.id, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::CandidateMissing(id) if id == foreign.id));
        assert_eq!(store.ballot_count(election.id).await.unwrap(), 0);
        let stored = store.find_by_token(&invitation.token).await.unwrap().unwrap();
        assert_eq!(stored.status, InvitationStatus::Pending);
        assert_eq!(store.candidate(foreign.id).await.unwrap().unwrap().vote_count, 0);
    }

    #[rocket::async_test]
    async fn closed_invitation_cannot_commit() {
        let (store, election, candidate) = seeded();
        let invitation = invite(&store, NewInvitation::example(election.id, Id::new())).await;
        assert!(store.mark_expired(invitation.id).await.unwrap());

        let err = store
            .commit_ballot_atomic(&invitation, candidate.id, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::InvitationClosed(_)));
        assert!(err.is_retryable());
    }

    #[rocket::async_test]
    async fn injected_failures_are_transient_and_run_out() {
        let (store, election, candidate) = seeded();
        let invitation = invite(&store, NewInvitation::example(election.id, Id::new())).await;
        store.fail_next_commits(1);

        let err = store
            .commit_ballot_atomic(&invitation, candidate.id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transient(_)));
        assert!(err.is_retryable());

        store
            .commit_ballot_atomic(&invitation, candidate.id, Utc::now())
            .await
            .unwrap();
    }

    #[rocket::async_test]
    async fn create_many_rejects_clashes_without_writing() {
        let store = MemoryStore::new();
        let election = Id::new();
        let voter = Id::new();
        invite(&store, NewInvitation::example(election, voter)).await;

        let newcomer = Id::new();
        let err = store
            .create_many(vec![
                NewInvitation::example(election, newcomer),
                NewInvitation::example(election, voter),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateInvitation));
        assert!(store
            .find_by_election_and_voter(election, newcomer)
            .await
            .unwrap()
            .is_none());

        // Duplicates within a single call are caught too.
        let err = store
            .create_many(vec![
                NewInvitation::example(election, newcomer),
                NewInvitation::example(election, newcomer),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateInvitation));
        assert_eq!(store.invited_voters(election).await.unwrap(), HashSet::from([voter]));
    }

    #[rocket::async_test]
    async fn notified_only_from_pending() {
        let store = MemoryStore::new();
        let election = Id::new();
        let invitation = invite(&store, NewInvitation::example(election, Id::new())).await;
        let now = Utc::now();

        assert_eq!(store.mark_notified(&[invitation.id, Id::new()], now).await.unwrap(), 1);
        assert_eq!(store.mark_notified(&[invitation.id], now).await.unwrap(), 0);

        let stored = store.find_by_token(&invitation.token).await.unwrap().unwrap();
        assert_eq!(stored.status, InvitationStatus::Notified);
        assert_eq!(stored.notified_at, Some(now));
        assert!(store.pending_for_batch(election, 1, now).await.unwrap().is_empty());
    }

    #[rocket::async_test]
    async fn expiry_sweep_touches_only_overdue_open_invitations() {
        let store = MemoryStore::new();
        let election = Id::new();
        invite(&store, NewInvitation::example(election, Id::new())).await;
        invite(&store, NewInvitation::expired_example(election, Id::new())).await;

        assert_eq!(store.expire_overdue(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.expire_overdue(Utc::now()).await.unwrap(), 0);

        let counts = store.status_counts(election).await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.expired, 1);

        assert_eq!(
            store
                .expire_overdue(Utc::now() + Duration::days(2))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.status_counts(election).await.unwrap().expired, 2);
    }

    #[rocket::async_test]
    async fn next_pending_batch_is_the_lowest() {
        let store = MemoryStore::new();
        let election = Id::new();
        let now = Utc::now();
        let later = now + Duration::days(1);
        let first = invite(&store, NewInvitation::new(election, Id::new(), 1, now, later)).await;
        invite(&store, NewInvitation::new(election, Id::new(), 2, now, later)).await;
        invite(&store, NewInvitation::new(election, Id::new(), 3, now, later)).await;

        assert_eq!(store.next_pending_batch(election, now).await.unwrap(), Some(1));
        store.mark_notified(&[first.id], now).await.unwrap();
        assert_eq!(store.next_pending_batch(election, now).await.unwrap(), Some(2));
        assert_eq!(store.next_pending_batch(Id::new(), now).await.unwrap(), None);
        assert_eq!(store.next_pending_batch(election, later).await.unwrap(), None);
    }

    #[rocket::async_test]
    async fn overdue_invitations_are_not_pending_for_delivery() {
        let store = MemoryStore::new();
        let election = Id::new();
        let fresh = invite(&store, NewInvitation::example(election, Id::new())).await;
        invite(&store, NewInvitation::expired_example(election, Id::new())).await;
        let now = Utc::now();

        let pending = store.pending_for_batch(election, 1, now).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, fresh.id);
        // Still pending until the sweep gets to it.
        assert_eq!(store.status_counts(election).await.unwrap().pending, 2);

        store.mark_notified(&[fresh.id], now).await.unwrap();
        assert_eq!(store.next_pending_batch(election, now).await.unwrap(), None);
    }
}

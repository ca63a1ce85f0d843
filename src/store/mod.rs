//! Durable state behind the voting engine: the invitation token store, the
//! ballot ledger, and read access to the externally-owned elections and
//! candidates.
//!
//! Everything goes through the [`VotingStore`] trait so the engine can run
//! against MongoDB in production and against an in-memory store in tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mongodb::error::Error as DbError;
use thiserror::Error;

use crate::model::{
    common::StatusCounts,
    db::{Ballot, Candidate, Election, Invitation, NewInvitation},
    mongodb::{is_transient_error, Id},
};

#[cfg(test)]
pub mod memory;
pub mod mongo;

#[cfg(test)]
pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Failures reported by a [`VotingStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Voter {voter} already holds a ballot for election {election}")]
    DuplicateBallot { election: Id, voter: Id },
    #[error("Another invitation already exists for one of these voters or tokens")]
    DuplicateInvitation,
    #[error("Invitation {0} is no longer open")]
    InvitationClosed(Id),
    #[error("Candidate {0} not found in the election")]
    CandidateMissing(Id),
    #[error("Transient storage failure: {0}")]
    Transient(String),
    #[error(transparent)]
    Db(DbError),
}

impl StoreError {
    /// Whether re-running the whole operation from scratch may succeed.
    ///
    /// A closed invitation or a clashing invitation is listed here because the
    /// re-run sees the new state and resolves it properly (e.g. as an already
    /// used token, or as a voter to skip).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::InvitationClosed(_) | Self::DuplicateInvitation
        )
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        if is_transient_error(&err) {
            Self::Transient(err.to_string())
        } else {
            Self::Db(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Read access to elections and candidates, which are owned elsewhere.
#[rocket::async_trait]
pub trait ElectionDirectory: Send + Sync {
    async fn election(&self, election_id: Id) -> Result<Option<Election>>;

    async fn candidate(&self, candidate_id: Id) -> Result<Option<Candidate>>;

    /// All candidates standing in the election, in a stable order.
    async fn candidates_for(&self, election_id: Id) -> Result<Vec<Candidate>>;
}

/// The invitation token store.
#[rocket::async_trait]
pub trait InvitationStore: Send + Sync {
    async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>>;

    async fn find_by_election_and_voter(
        &self,
        election_id: Id,
        voter_id: Id,
    ) -> Result<Option<Invitation>>;

    /// Every voter that already holds an invitation for the election.
    async fn invited_voters(&self, election_id: Id) -> Result<HashSet<Id>>;

    /// Persist all the invitations, or none of them.
    ///
    /// Fails with [`StoreError::DuplicateInvitation`] if any of them clashes
    /// with an existing token or `(election, voter)` pair.
    async fn create_many(&self, invitations: Vec<NewInvitation>) -> Result<u64>;

    /// Invitations of the batch that are still `pending` and not yet overdue
    /// at `now`, oldest first.
    async fn pending_for_batch(
        &self,
        election_id: Id,
        batch_number: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invitation>>;

    /// The lowest batch number that still has `pending` invitations which are
    /// not overdue at `now`.
    async fn next_pending_batch(&self, election_id: Id, now: DateTime<Utc>)
        -> Result<Option<u32>>;

    /// Move `pending` invitations to `notified`. Others are left alone.
    /// Returns how many were updated.
    async fn mark_notified(&self, ids: &[Id], at: DateTime<Utc>) -> Result<u64>;

    /// Move an open invitation to `expired`.
    /// Returns false if it was already terminal (or does not exist).
    async fn mark_expired(&self, id: Id) -> Result<bool>;

    /// Expire every open invitation whose expiry is at or before `now`.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn status_counts(&self, election_id: Id) -> Result<StatusCounts>;
}

/// The ballot ledger.
#[rocket::async_trait]
pub trait BallotLedger: Send + Sync {
    /// In one atomic step: record the ballot, mark the invitation `voted`,
    /// and increment the candidate's tally.
    ///
    /// Fails without any effect if the voter already has a ballot, the
    /// invitation is no longer open, or the candidate does not belong to the
    /// invitation's election.
    async fn commit_ballot_atomic(
        &self,
        invitation: &Invitation,
        candidate_id: Id,
        cast_at: DateTime<Utc>,
    ) -> Result<Ballot>;

    async fn ballot_count(&self, election_id: Id) -> Result<u64>;

    /// Count ballots per candidate from the ballots themselves.
    async fn recount(&self, election_id: Id) -> Result<HashMap<Id, u64>>;
}

/// Everything the voting engine needs from storage.
pub trait VotingStore: ElectionDirectory + InvitationStore + BallotLedger {}

impl<T> VotingStore for T where T: ElectionDirectory + InvitationStore + BallotLedger {}

/// The store as placed into Rocket's managed state.
pub type SharedStore = Arc<dyn VotingStore>;

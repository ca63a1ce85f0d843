use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use mongodb::{
    bson::{self, doc, Bson, Document},
    options::{FindOneOptions, FindOptions},
    Client, ClientSession, Database,
};
use rocket::futures::TryStreamExt;
use serde::{de::DeserializeOwned, Deserialize};

use crate::model::{
    common::{InvitationStatus, StatusCounts},
    db::{Ballot, Candidate, Election, Invitation, NewBallot, NewInvitation},
    mongodb::{is_duplicate_key_error, Coll, Id},
};

use super::{BallotLedger, ElectionDirectory, InvitationStore, Result, StoreError};

/// A [`VotingStore`](super::VotingStore) backed by MongoDB.
///
/// Multi-document writes run in client-session transactions, so the server
/// must be a replica set.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    pub fn new(client: Client, db: Database) -> Self {
        Self { client, db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn elections(&self) -> Coll<Election> {
        Coll::from_db(&self.db)
    }

    fn candidates(&self) -> Coll<Candidate> {
        Coll::from_db(&self.db)
    }

    fn invitations(&self) -> Coll<Invitation> {
        Coll::from_db(&self.db)
    }

    fn ballots(&self) -> Coll<Ballot> {
        Coll::from_db(&self.db)
    }

    /// The writes of [`BallotLedger::commit_ballot_atomic`], inside an open transaction.
    async fn commit_in_session(
        &self,
        invitation: &Invitation,
        candidate_id: Id,
        cast_at: DateTime<Utc>,
        session: &mut ClientSession,
    ) -> Result<Ballot> {
        let election_id = invitation.election_id;
        let voter_id = invitation.voter_id;

        // The unique (election_id, voter_id) index is the one-ballot guarantee.
        let ballot = Ballot {
            id: Id::new(),
            ballot: NewBallot {
                election_id,
                voter_id,
                candidate_id,
                cast_at,
            },
        };
        self.ballots()
            .insert_one_with_session(&ballot, None, session)
            .await
            .map_err(|err| {
                if is_duplicate_key_error(&err) {
                    StoreError::DuplicateBallot {
                        election: election_id,
                        voter: voter_id,
                    }
                } else {
                    err.into()
                }
            })?;

        // Close the invitation, but only if nobody else did first.
        let filter = doc! {
            "_id": invitation.id,
            "status": {"$in": open_statuses()},
        };
        let update = doc! {
            "$set": {"status": InvitationStatus::Voted},
        };
        let result = self
            .invitations()
            .update_one_with_session(filter, update, None, session)
            .await?;
        if result.matched_count != 1 {
            return Err(StoreError::InvitationClosed(invitation.id));
        }

        // Bump the tally in place.
        let filter = doc! {
            "_id": candidate_id,
            "election_id": election_id,
        };
        let update = doc! {
            "$inc": {"vote_count": 1_i64},
        };
        let result = self
            .candidates()
            .update_one_with_session(filter, update, None, session)
            .await?;
        if result.matched_count != 1 {
            return Err(StoreError::CandidateMissing(candidate_id));
        }

        Ok(ballot)
    }
}

fn open_statuses() -> Vec<Bson> {
    InvitationStatus::OPEN.into_iter().map(Bson::from).collect()
}

/// One row of a `$group` by some key with a `$sum: 1` counter.
#[derive(Deserialize)]
struct Group<K> {
    #[serde(rename = "_id")]
    key: K,
    count: i64,
}

/// Run a `$match` + `$group` pipeline over the given key and collect the counts.
async fn group_counts<T, K>(coll: &Coll<T>, filter: Document, key: &str) -> Result<Vec<Group<K>>>
where
    K: DeserializeOwned,
{
    let pipeline = [
        doc! {"$match": filter},
        doc! {"$group": {"_id": format!("${key}"), "count": {"$sum": 1}}},
    ];
    let documents: Vec<Document> = coll.aggregate(pipeline, None).await?.try_collect().await?;
    documents
        .into_iter()
        .map(|document| {
            bson::from_document(document)
                .map_err(|e| StoreError::Db(mongodb::error::Error::from(e)))
        })
        .collect()
}

#[rocket::async_trait]
impl ElectionDirectory for MongoStore {
    async fn election(&self, election_id: Id) -> Result<Option<Election>> {
        Ok(self.elections().find_one(election_id.as_doc(), None).await?)
    }

    async fn candidate(&self, candidate_id: Id) -> Result<Option<Candidate>> {
        Ok(self.candidates().find_one(candidate_id.as_doc(), None).await?)
    }

    async fn candidates_for(&self, election_id: Id) -> Result<Vec<Candidate>> {
        let options = FindOptions::builder().sort(doc! {"_id": 1}).build();
        let candidates = self
            .candidates()
            .find(doc! {"election_id": election_id}, options)
            .await?
            .try_collect()
            .await?;
        Ok(candidates)
    }
}

#[rocket::async_trait]
impl InvitationStore for MongoStore {
    async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>> {
        Ok(self
            .invitations()
            .find_one(doc! {"token": token}, None)
            .await?)
    }

    async fn find_by_election_and_voter(
        &self,
        election_id: Id,
        voter_id: Id,
    ) -> Result<Option<Invitation>> {
        let filter = doc! {
            "election_id": election_id,
            "voter_id": voter_id,
        };
        Ok(self.invitations().find_one(filter, None).await?)
    }

    async fn invited_voters(&self, election_id: Id) -> Result<HashSet<Id>> {
        let voters = self
            .invitations()
            .distinct("voter_id", doc! {"election_id": election_id}, None)
            .await?;
        Ok(voters
            .into_iter()
            .filter_map(|voter| voter.as_object_id().map(Id::from))
            .collect())
    }

    async fn create_many(&self, invitations: Vec<NewInvitation>) -> Result<u64> {
        if invitations.is_empty() {
            return Ok(0);
        }

        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;

        let result = Coll::<NewInvitation>::from_db(&self.db)
            .insert_many_with_session(&invitations, None, &mut session)
            .await;
        match result {
            Ok(inserted) => {
                session.commit_transaction().await?;
                Ok(inserted.inserted_ids.len() as u64)
            }
            Err(err) => {
                // Best effort; the transaction is discarded server-side either way.
                if let Err(abort_err) = session.abort_transaction().await {
                    debug!("Failed to abort invitation transaction: {abort_err}");
                }
                if is_duplicate_key_error(&err) {
                    Err(StoreError::DuplicateInvitation)
                } else {
                    Err(err.into())
                }
            }
        }
    }

    async fn pending_for_batch(
        &self,
        election_id: Id,
        batch_number: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invitation>> {
        let filter = doc! {
            "election_id": election_id,
            "batch_number": batch_number,
            "status": InvitationStatus::Pending,
            "expires_at": {"$gt": bson::DateTime::from_chrono(now)},
        };
        let options = FindOptions::builder().sort(doc! {"_id": 1}).build();
        let invitations = self
            .invitations()
            .find(filter, options)
            .await?
            .try_collect()
            .await?;
        Ok(invitations)
    }

    async fn next_pending_batch(
        &self,
        election_id: Id,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        let filter = doc! {
            "election_id": election_id,
            "status": InvitationStatus::Pending,
            "expires_at": {"$gt": bson::DateTime::from_chrono(now)},
        };
        let options = FindOneOptions::builder()
            .sort(doc! {"batch_number": 1})
            .build();
        let invitation = self.invitations().find_one(filter, options).await?;
        Ok(invitation.map(|invitation| invitation.batch_number))
    }

    async fn mark_notified(&self, ids: &[Id], at: DateTime<Utc>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Bson> = ids.iter().copied().map(Bson::from).collect();
        let filter = doc! {
            "_id": {"$in": ids},
            "status": InvitationStatus::Pending,
        };
        let update = doc! {
            "$set": {
                "status": InvitationStatus::Notified,
                "notified_at": bson::DateTime::from_chrono(at),
            },
        };
        let result = self.invitations().update_many(filter, update, None).await?;
        Ok(result.modified_count)
    }

    async fn mark_expired(&self, id: Id) -> Result<bool> {
        let filter = doc! {
            "_id": id,
            "status": {"$in": open_statuses()},
        };
        let update = doc! {
            "$set": {"status": InvitationStatus::Expired},
        };
        let result = self.invitations().update_one(filter, update, None).await?;
        Ok(result.modified_count == 1)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        let filter = doc! {
            "status": {"$in": open_statuses()},
            "expires_at": {"$lte": bson::DateTime::from_chrono(now)},
        };
        let update = doc! {
            "$set": {"status": InvitationStatus::Expired},
        };
        let result = self.invitations().update_many(filter, update, None).await?;
        Ok(result.modified_count)
    }

    async fn status_counts(&self, election_id: Id) -> Result<StatusCounts> {
        let groups: Vec<Group<InvitationStatus>> = group_counts(
            &self.invitations(),
            doc! {"election_id": election_id},
            "status",
        )
        .await?;
        let mut counts = StatusCounts::default();
        for group in groups {
            counts.record(group.key, group.count as u64);
        }
        Ok(counts)
    }
}

#[rocket::async_trait]
impl BallotLedger for MongoStore {
    async fn commit_ballot_atomic(
        &self,
        invitation: &Invitation,
        candidate_id: Id,
        cast_at: DateTime<Utc>,
    ) -> Result<Ballot> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;

        match self
            .commit_in_session(invitation, candidate_id, cast_at, &mut session)
            .await
        {
            Ok(ballot) => {
                session.commit_transaction().await?;
                Ok(ballot)
            }
            Err(err) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    debug!("Failed to abort ballot transaction: {abort_err}");
                }
                Err(err)
            }
        }
    }

    async fn ballot_count(&self, election_id: Id) -> Result<u64> {
        Ok(self
            .ballots()
            .count_documents(doc! {"election_id": election_id}, None)
            .await?)
    }

    async fn recount(&self, election_id: Id) -> Result<HashMap<Id, u64>> {
        let groups: Vec<Group<Id>> = group_counts(
            &self.ballots(),
            doc! {"election_id": election_id},
            "candidate_id",
        )
        .await?;
        Ok(groups
            .into_iter()
            .map(|group| (group.key, group.count as u64))
            .collect())
    }
}

#[cfg(all(test, feature = "db-tests"))]
mod tests {
    use std::collections::HashSet;

    use chrono::Duration;
    use mongodb::Database;

    use rocket::futures::future::join_all;

    use super::*;
    use crate::{
        config::Config,
        model::db::NewInvitation,
        voting::{cast_vote, RetryPolicy, VoteError},
    };

    async fn seed(db: &Database) -> (Election, Candidate) {
        let election = Election::active_example();
        let candidate = Candidate::example(election.id, "Ada");
        Coll::<Election>::from_db(db)
            .insert_one(&election, None)
            .await
            .unwrap();
        Coll::<Candidate>::from_db(db)
            .insert_one(&candidate, None)
            .await
            .unwrap();
        (election, candidate)
    }

    #[backend_test]
    async fn commit_inserts_ballot_closes_invitation_and_counts(store: MongoStore) {
        let (election, candidate) = seed(store.database()).await;
        let voter = Id::new();
        store
            .create_many(vec![NewInvitation::example(election.id, voter)])
            .await
            .unwrap();
        let invitation = store
            .find_by_election_and_voter(election.id, voter)
            .await
            .unwrap()
            .unwrap();

        let ballot = store
            .commit_ballot_atomic(&invitation, candidate.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(ballot.voter_id, voter);

        let invitation = store.find_by_token(&invitation.token).await.unwrap().unwrap();
        assert_eq!(invitation.status, InvitationStatus::Voted);
        let candidate = store.candidate(candidate.id).await.unwrap().unwrap();
        assert_eq!(candidate.vote_count, 1);
        assert_eq!(store.ballot_count(election.id).await.unwrap(), 1);
        assert_eq!(store.recount(election.id).await.unwrap()[&candidate.id], 1);

        // A second commit for the same voter is rejected by the unique index.
        let err = store
            .commit_ballot_atomic(&invitation, candidate.id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateBallot { .. }));
        let candidate = store.candidate(candidate.id).await.unwrap().unwrap();
        assert_eq!(candidate.vote_count, 1);
    }

    #[backend_test]
    async fn commit_rolls_back_for_foreign_candidate(store: MongoStore) {
        let (election, _) = seed(store.database()).await;
        let (_, foreign) = seed(store.database()).await;
        let invitation_core = NewInvitation::example(election.id, Id::new());
        store.create_many(vec![invitation_core.clone()]).await.unwrap();
        let invitation = store
            .find_by_token(&invitation_core.token)
            .await
            .unwrap()
            .unwrap();

        let err = store
            .commit_ballot_atomic(&invitation, foreign.id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CandidateMissing(id) if id == foreign.id));

        // Nothing from the aborted transaction is visible.
        assert_eq!(store.ballot_count(election.id).await.unwrap(), 0);
        let invitation = store.find_by_token(&invitation.token).await.unwrap().unwrap();
        assert_eq!(invitation.status, InvitationStatus::Pending);
    }

    #[backend_test]
    async fn create_many_is_all_or_nothing(store: MongoStore) {
        let election = Id::new();
        let voter = Id::new();
        store
            .create_many(vec![NewInvitation::example(election, voter)])
            .await
            .unwrap();

        let clash = vec![
            NewInvitation::example(election, Id::new()),
            NewInvitation::example(election, voter),
        ];
        let err = store.create_many(clash).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateInvitation));
        assert_eq!(store.invited_voters(election).await.unwrap(), HashSet::from([voter]));
    }

    #[backend_test]
    async fn statuses_move_forward_only(store: MongoStore) {
        let election = Id::new();
        let fresh = NewInvitation::example(election, Id::new());
        let stale = NewInvitation::expired_example(election, Id::new());
        store
            .create_many(vec![fresh.clone(), stale.clone()])
            .await
            .unwrap();
        let fresh = store.find_by_token(&fresh.token).await.unwrap().unwrap();

        let pending = store.pending_for_batch(election, 1, Utc::now()).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, fresh.id);
        assert_eq!(store.next_pending_batch(election, Utc::now()).await.unwrap(), Some(1));
        assert_eq!(store.mark_notified(&[fresh.id], Utc::now()).await.unwrap(), 1);
        assert_eq!(store.next_pending_batch(election, Utc::now()).await.unwrap(), None);
        assert_eq!(store.mark_notified(&[fresh.id], Utc::now()).await.unwrap(), 0);

        assert_eq!(store.expire_overdue(Utc::now()).await.unwrap(), 1);
        let counts = store.status_counts(election).await.unwrap();
        assert_eq!(counts.notified, 1);
        assert_eq!(counts.expired, 1);

        let later = Utc::now() + Duration::days(2);
        assert_eq!(store.expire_overdue(later).await.unwrap(), 1);
        assert!(!store.mark_expired(fresh.id).await.unwrap());
        assert_eq!(store.next_pending_batch(election, later).await.unwrap(), None);
    }

    /// Create an invitation per voter and return their tokens.
    async fn invite_all(store: &MongoStore, election_id: Id, count: usize) -> Vec<String> {
        let invitations: Vec<_> = (0..count)
            .map(|_| NewInvitation::example(election_id, Id::new()))
            .collect();
        let tokens = invitations.iter().map(|i| i.token.to_string()).collect();
        store.create_many(invitations).await.unwrap();
        tokens
    }

    #[backend_test]
    async fn concurrent_casts_with_distinct_tokens_all_count(store: MongoStore) {
        let (election, candidate) = seed(store.database()).await;
        let tokens = invite_all(&store, election.id, 50).await;
        let policy = Config::default().retry_policy();

        // Every commit bumps the same tally, so these transactions conflict.
        let casts = tokens.into_iter().map(|token| {
            let store = store.clone();
            let (election_id, candidate_id) = (election.id, candidate.id);
            rocket::tokio::spawn(async move {
                cast_vote(&store, &token, election_id, candidate_id, policy).await
            })
        });
        for result in join_all(casts).await {
            result.unwrap().unwrap();
        }

        assert_eq!(store.ballot_count(election.id).await.unwrap(), 50);
        let tally = store.candidate(candidate.id).await.unwrap().unwrap();
        assert_eq!(tally.vote_count, 50);
        assert_eq!(store.recount(election.id).await.unwrap()[&candidate.id], 50);
        assert_eq!(store.status_counts(election.id).await.unwrap().voted, 50);
    }

    #[backend_test]
    async fn concurrent_casts_with_one_token_count_once(store: MongoStore) {
        let (election, candidate) = seed(store.database()).await;
        let token = invite_all(&store, election.id, 1).await.remove(0);
        let policy = Config::default().retry_policy();

        let casts = (0..2).map(|_| {
            let store = store.clone();
            let token = token.clone();
            let (election_id, candidate_id) = (election.id, candidate.id);
            rocket::tokio::spawn(async move {
                cast_vote(&store, &token, election_id, candidate_id, policy).await
            })
        });
        let results: Vec<_> = join_all(casts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(VoteError::AlreadyVoted))));
        assert_eq!(store.ballot_count(election.id).await.unwrap(), 1);
        let tally = store.candidate(candidate.id).await.unwrap().unwrap();
        assert_eq!(tally.vote_count, 1);
    }

    #[backend_test]
    async fn commit_refuses_an_invitation_expired_meanwhile(store: MongoStore) {
        let (election, candidate) = seed(store.database()).await;
        let token = invite_all(&store, election.id, 1).await.remove(0);
        let invitation = store.find_by_token(&token).await.unwrap().unwrap();
        assert!(store.mark_expired(invitation.id).await.unwrap());

        let err = store
            .commit_ballot_atomic(&invitation, candidate.id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvitationClosed(id) if id == invitation.id));
        assert_eq!(store.ballot_count(election.id).await.unwrap(), 0);

        let err = cast_vote(&store, &token, election.id, candidate.id, RetryPolicy::attempts(0))
            .await
            .unwrap_err();
        assert!(matches!(err, VoteError::TokenExpired));
    }
}

use std::ops::Deref;

use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};

use crate::model::db::{Ballot, Candidate, Election, Invitation, NewBallot, NewInvitation};

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Election collections (read-only here).
const ELECTIONS: &str = "elections";
impl MongoCollection for Election {
    const NAME: &'static str = ELECTIONS;
}

// Candidate collections (only the tally is written here).
const CANDIDATES: &str = "candidates";
impl MongoCollection for Candidate {
    const NAME: &'static str = CANDIDATES;
}

// Invitation collections
const INVITATIONS: &str = "invitations";
impl MongoCollection for Invitation {
    const NAME: &'static str = INVITATIONS;
}
impl MongoCollection for NewInvitation {
    const NAME: &'static str = INVITATIONS;
}

// Ballot collections
const BALLOTS: &str = "ballots";
impl MongoCollection for Ballot {
    const NAME: &'static str = BALLOTS;
}
impl MongoCollection for NewBallot {
    const NAME: &'static str = BALLOTS;
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();

    // Invitation collection: tokens are globally unique, and each voter is
    // invited at most once per election.
    let token_index = IndexModel::builder()
        .keys(doc! {"token": 1})
        .options(unique.clone())
        .build();
    let voter_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "voter_id": 1})
        .options(unique.clone())
        .build();
    let batch_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "batch_number": 1, "status": 1})
        .build();
    Coll::<Invitation>::from_db(db)
        .create_indexes([token_index, voter_index, batch_index], None)
        .await?;

    // Ballot collection: one ballot per voter per election.
    let ballot_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "voter_id": 1})
        .options(unique)
        .build();
    Coll::<Ballot>::from_db(db)
        .create_index(ballot_index, None)
        .await?;

    Ok(())
}

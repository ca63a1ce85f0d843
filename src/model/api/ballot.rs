use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{api::id::ApiId, db::Ballot, mongodb::Id};

/// A voter's choice, submitted alongside their token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastRequest {
    pub election_id: Id,
    pub candidate_id: Id,
}

/// API-friendly view of a committed ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotReceipt {
    pub id: ApiId,
    pub election_id: ApiId,
    pub voter_id: ApiId,
    pub candidate_id: ApiId,
    pub cast_at: DateTime<Utc>,
}

impl From<Ballot> for BallotReceipt {
    fn from(ballot: Ballot) -> Self {
        Self {
            id: ballot.id.into(),
            election_id: ballot.election_id.into(),
            voter_id: ballot.voter_id.into(),
            candidate_id: ballot.candidate_id.into(),
            cast_at: ballot.cast_at,
        }
    }
}

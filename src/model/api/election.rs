use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    api::id::ApiId,
    common::ElectionStatus,
    db::{Candidate, Election},
};

/// What a voter sees before casting: the election and its candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionSummary {
    pub id: ApiId,
    pub name: String,
    pub status: ElectionStatus,
    pub department_id: Option<ApiId>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub candidates: Vec<CandidateSummary>,
}

impl ElectionSummary {
    pub fn new(election: Election, candidates: Vec<Candidate>) -> Self {
        Self {
            id: election.id.into(),
            name: election.name,
            status: election.status,
            department_id: election.department_id.map(Into::into),
            start_time: election.start_time,
            end_time: election.end_time,
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }
}

/// A candidate as shown on the ballot; deliberately without the tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub id: ApiId,
    pub name: String,
}

impl From<Candidate> for CandidateSummary {
    fn from(candidate: Candidate) -> Self {
        Self {
            id: candidate.id.into(),
            name: candidate.name,
        }
    }
}

/// Current tallies for an election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionResults {
    pub election_id: ApiId,
    /// Ballots committed for this election.
    pub ballots: u64,
    pub tallies: Vec<CandidateTally>,
    /// Whether every tally agrees with a recount of the ballots.
    pub recount_matches: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTally {
    pub candidate_id: ApiId,
    pub name: String,
    pub votes: u64,
}

impl From<Candidate> for CandidateTally {
    fn from(candidate: Candidate) -> Self {
        Self {
            candidate_id: candidate.id.into(),
            name: candidate.name,
            votes: candidate.vote_count,
        }
    }
}

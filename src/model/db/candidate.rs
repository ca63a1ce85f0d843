use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// A candidate, as registered by the election administration.
///
/// Everything except `vote_count` is owned elsewhere; the ballot ledger only
/// ever touches the tally, and only with an atomic increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "_id")]
    pub id: Id,
    pub election_id: Id,
    pub name: String,
    #[serde(default)]
    pub vote_count: u64,
}

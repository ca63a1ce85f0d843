use crate::{
    model::{
        api::{
            election::{CandidateTally, ElectionResults},
            invitation::QueueStatus,
        },
        mongodb::Id,
    },
    store::VotingStore,
};

use super::VoteError;

/// Current tallies for an election, checked against a recount of its ballots.
pub async fn election_results(
    store: &dyn VotingStore,
    election_id: Id,
) -> Result<ElectionResults, VoteError> {
    if store.election(election_id).await?.is_none() {
        return Err(VoteError::ElectionNotFound(election_id));
    }
    let candidates = store.candidates_for(election_id).await?;
    let ballots = store.ballot_count(election_id).await?;
    let recount = store.recount(election_id).await?;

    let recount_matches = candidates
        .iter()
        .all(|c| c.vote_count == recount.get(&c.id).copied().unwrap_or(0))
        && recount.values().sum::<u64>() == ballots;
    if !recount_matches {
        error!("Tallies for election {election_id} disagree with a recount of its ballots");
    }

    Ok(ElectionResults {
        election_id: election_id.into(),
        ballots,
        tallies: candidates.into_iter().map(CandidateTally::from).collect(),
        recount_matches,
    })
}

/// Invitation progress for an election.
pub async fn queue_status(store: &dyn VotingStore, election_id: Id) -> Result<QueueStatus, VoteError> {
    Ok(store.status_counts(election_id).await?.into())
}

use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::{
    model::{
        api::election::ElectionSummary,
        common::InvitationStatus,
        db::{Ballot, Invitation},
        mongodb::Id,
    },
    store::{StoreError, VotingStore},
};

use super::{RetryPolicy, VoteError};

/// Look up the invitation behind `token` and make sure it can still be used.
///
/// An invitation found past its expiry is marked expired on the way out, so
/// this is the only write either entry point performs before committing.
async fn open_invitation(
    store: &dyn VotingStore,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Invitation, VoteError> {
    let invitation = store
        .find_by_token(token)
        .await?
        .ok_or(VoteError::InvalidToken)?;

    match invitation.status {
        InvitationStatus::Voted => Err(VoteError::AlreadyVoted),
        InvitationStatus::Expired => Err(VoteError::TokenExpired),
        _ if invitation.is_overdue(now) => {
            if store.mark_expired(invitation.id).await? {
                info!("Invitation {} expired on use", invitation.id);
            }
            Err(VoteError::TokenExpired)
        }
        _ => Ok(invitation),
    }
}

/// Check a token and describe the election it grants a vote in.
pub async fn validate_token(
    store: &dyn VotingStore,
    token: &str,
) -> Result<ElectionSummary, VoteError> {
    let invitation = open_invitation(store, token, Utc::now()).await?;
    let election_id = invitation.election_id;
    let election = store
        .election(election_id)
        .await?
        .ok_or(VoteError::ElectionNotFound(election_id))?;
    let candidates = store.candidates_for(election_id).await?;
    Ok(ElectionSummary::new(election, candidates))
}

/// Cast a ballot for `candidate_id` with the invitation behind `token`.
///
/// If storage fails in a retryable way, the whole sequence (token lookup
/// included) is run again for as long as `policy` allows. A re-run sees any
/// ballot that got committed meanwhile and reports it as already voted.
///
/// An invitation closed under our feet (by another cast or the expiry sweep)
/// always gets one more look, whatever the policy, so the caller learns
/// whether the token was used or expired.
pub async fn cast_vote(
    store: &dyn VotingStore,
    token: &str,
    election_id: Id,
    candidate_id: Id,
    policy: RetryPolicy,
) -> Result<Ballot, VoteError> {
    let started = Instant::now();
    let mut reruns = 0;
    let mut rechecked_closed = false;
    loop {
        match try_cast(store, token, election_id, candidate_id).await {
            Err(VoteError::Store(StoreError::InvitationClosed(id))) if !rechecked_closed => {
                rechecked_closed = true;
                debug!("Invitation {id} closed during the cast, looking again");
            }
            Err(VoteError::Store(err))
                if err.is_retryable() && policy.allows(reruns, started) =>
            {
                reruns += 1;
                warn!("Re-running ballot cast ({reruns}) after storage failure: {err}");
                policy.back_off(reruns).await;
            }
            result => return result,
        }
    }
}

async fn try_cast(
    store: &dyn VotingStore,
    token: &str,
    election_id: Id,
    candidate_id: Id,
) -> Result<Ballot, VoteError> {
    let now = Utc::now();
    let invitation = open_invitation(store, token, now).await?;

    if invitation.election_id != election_id {
        return Err(VoteError::ElectionMismatch);
    }
    let election = store
        .election(election_id)
        .await?
        .ok_or(VoteError::ElectionNotFound(election_id))?;
    if !election.is_active() {
        return Err(VoteError::ElectionInactive(election_id));
    }
    match store.candidate(candidate_id).await? {
        Some(candidate) if candidate.election_id == election_id => {}
        _ => return Err(VoteError::InvalidCandidate(candidate_id)),
    }

    match store
        .commit_ballot_atomic(&invitation, candidate_id, now)
        .await
    {
        Ok(ballot) => {
            info!("Ballot {} cast in election {election_id}", ballot.id);
            Ok(ballot)
        }
        Err(StoreError::DuplicateBallot { .. }) => Err(VoteError::AlreadyVoted),
        // The candidate vanished between the check and the commit.
        Err(StoreError::CandidateMissing(id)) => Err(VoteError::InvalidCandidate(id)),
        Err(err) => Err(err.into()),
    }
}

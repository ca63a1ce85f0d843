use std::{collections::HashSet, time::Instant};

use chrono::{Duration, Utc};

use crate::{
    config::Config,
    model::{api::invitation::ScheduleReport, db::NewInvitation, mongodb::Id},
    store::{StoreError, VotingStore},
};

use super::VoteError;

/// Partition `voters` into batches of `batch_size` and create a pending
/// invitation for each voter that does not already have one.
///
/// A voter's batch follows from their position in `voters`, so scheduling a
/// longer list later keeps existing assignments and only adds the newcomers.
/// Voters listed more than once are invited at their first position, but
/// every listing still takes up a position, so repeats can leave gaps in a
/// batch and count towards `total_batches`. A zero batch size schedules
/// nothing.
pub async fn schedule(
    store: &dyn VotingStore,
    election_id: Id,
    voters: &[Id],
    batch_size: u32,
    ttl: Duration,
) -> Result<ScheduleReport, StoreError> {
    if batch_size == 0 {
        return Ok(ScheduleReport::default());
    }
    let size = batch_size as usize;
    let total_batches = ((voters.len() + size - 1) / size) as u32;

    let existing = store.invited_voters(election_id).await?;
    let created_at = Utc::now();
    let expires_at = created_at + ttl;

    let mut seen = HashSet::new();
    let mut invitations = Vec::new();
    let mut first_batch_count = 0;
    for (index, voter) in voters.iter().enumerate() {
        if existing.contains(voter) || !seen.insert(*voter) {
            continue;
        }
        let batch_number = (index / size) as u32 + 1;
        if batch_number == 1 {
            first_batch_count += 1;
        }
        invitations.push(NewInvitation::new(
            election_id,
            *voter,
            batch_number,
            created_at,
            expires_at,
        ));
    }

    let created = store.create_many(invitations).await? as u32;
    Ok(ScheduleReport {
        total_batches,
        first_batch_count,
        created,
    })
}

/// Schedule invitations for an active election.
///
/// The batch size is taken from the request, then the election, then the
/// configured default. Scheduling races with a concurrent call for the same
/// voters are resolved by re-running, which then skips whoever got invited.
pub async fn schedule_batches(
    store: &dyn VotingStore,
    config: &Config,
    election_id: Id,
    voters: &[Id],
    batch_size: Option<u32>,
) -> Result<ScheduleReport, VoteError> {
    if batch_size == Some(0) {
        return Ok(ScheduleReport::default());
    }

    let election = store
        .election(election_id)
        .await?
        .ok_or(VoteError::ElectionNotFound(election_id))?;
    if !election.is_active() {
        return Err(VoteError::ElectionInactive(election_id));
    }
    let batch_size = batch_size
        .or(election.batch_size)
        .unwrap_or_else(|| config.default_batch_size());

    let policy = config.retry_policy();
    let started = Instant::now();
    let mut reruns = 0;
    let report = loop {
        match schedule(store, election_id, voters, batch_size, config.invitation_ttl()).await {
            Err(err) if err.is_retryable() && policy.allows(reruns, started) => {
                reruns += 1;
                warn!("Re-running scheduling for election {election_id} ({reruns}): {err}");
                policy.back_off(reruns).await;
            }
            result => break result?,
        }
    };

    info!(
        "Scheduled {} invitations in {} batches for election {election_id}",
        report.created, report.total_batches
    );
    Ok(report)
}

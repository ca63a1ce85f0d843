use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    api::id::ApiId,
    common::StatusCounts,
    db::Invitation,
    mongodb::Id,
};

/// What the dispatcher needs to deliver one invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationSummary {
    /// Invitation ID, to be reported back once delivered.
    pub id: ApiId,
    pub voter_id: ApiId,
    pub batch_number: u32,
    pub token: String,
    /// Link the voter follows to reach the ballot.
    pub vote_url: String,
    pub expires_at: DateTime<Utc>,
}

impl InvitationSummary {
    pub fn from_invitation(invitation: Invitation, vote_url_base: &str) -> Self {
        let Invitation { id, invitation } = invitation;
        let vote_url = format!(
            "{}/{}",
            vote_url_base.trim_end_matches('/'),
            invitation.token
        );
        Self {
            id: id.into(),
            voter_id: invitation.voter_id.into(),
            batch_number: invitation.batch_number,
            token: invitation.token.into(),
            vote_url,
            expires_at: invitation.expires_at,
        }
    }
}

/// A request to schedule invitations for the given voters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    /// Eligible voters, in batch order. Repeats are invited once, at their
    /// first position, but still occupy their later positions.
    pub voter_ids: Vec<Id>,
    /// Falls back to the election's batch size, then the configured default.
    #[serde(default)]
    pub batch_size: Option<u32>,
}

/// Outcome of a scheduling call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleReport {
    /// `ceil(voter_ids.len() / batch_size)`, or zero for a zero batch size.
    ///
    /// Counted over list positions, so a voter ID listed more than once takes
    /// up a position each time even though only its first one is invited.
    pub total_batches: u32,
    /// Invitations created in batch 1 by this call.
    pub first_batch_count: u32,
    /// Invitations created by this call across all batches.
    pub created: u32,
}

/// Result of reporting delivered invitations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifiedReport {
    /// Invitations that moved from pending to notified.
    pub updated: u64,
}

/// Result of dispatching the next pending batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// The batch that was handed to the dispatcher, if any was pending.
    pub batch_number: Option<u32>,
    /// Invitations handed to the dispatcher.
    pub dispatched: usize,
}

/// Invitation progress for an election.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total: u64,
    pub pending: u64,
    pub notified: u64,
    pub voted: u64,
    pub expired: u64,
    /// Percentage of invitations that have been used to vote.
    pub participation_rate: f64,
}

impl From<StatusCounts> for QueueStatus {
    fn from(counts: StatusCounts) -> Self {
        let total = counts.total();
        let participation_rate = if total > 0 {
            counts.voted as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total,
            pending: counts.pending,
            notified: counts.notified,
            voted: counts.voted,
            expired: counts.expired,
            participation_rate,
        }
    }
}

use mongodb::bson::{to_bson, Bson};
use serde::{Deserialize, Serialize};

/// States in the Election lifecycle, as reported by the election registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionStatus {
    /// Created, but not yet open.
    Planned,
    /// Open: invitations may be issued and ballots cast.
    Active,
    /// Closed.
    Finished,
}

impl From<ElectionStatus> for Bson {
    fn from(status: ElectionStatus) -> Self {
        to_bson(&status).expect("Serialisation is infallible")
    }
}

/// States in the Invitation lifecycle.
///
/// ```text
/// Pending ──delivered──> Notified
///    │                      │
///    ├──────ballot cast─────┴──> Voted
///    └──────expiry seen─────┴──> Expired
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    /// Created by the scheduler, not yet delivered.
    Pending,
    /// The dispatcher confirmed delivery.
    Notified,
    /// A ballot was committed with this invitation. Terminal.
    Voted,
    /// The invitation was observed after its expiry time. Terminal.
    Expired,
}

impl InvitationStatus {
    /// Statuses from which a ballot may still be cast.
    pub const OPEN: [InvitationStatus; 2] = [InvitationStatus::Pending, InvitationStatus::Notified];

    /// Whether no further transition is permitted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Voted | Self::Expired)
    }

    /// Whether the invitation can still be used to vote.
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }
}

impl From<InvitationStatus> for Bson {
    fn from(status: InvitationStatus) -> Self {
        to_bson(&status).expect("Serialisation is infallible")
    }
}

/// Per-status invitation counts for one election.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub notified: u64,
    pub voted: u64,
    pub expired: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.notified + self.voted + self.expired
    }

    /// Add `count` invitations in the given status.
    pub fn record(&mut self, status: InvitationStatus, count: u64) {
        match status {
            InvitationStatus::Pending => self.pending += count,
            InvitationStatus::Notified => self.notified += count,
            InvitationStatus::Voted => self.voted += count,
            InvitationStatus::Expired => self.expired += count,
        }
    }
}

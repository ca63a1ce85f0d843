use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::{
    common::{InvitationStatus, Token},
    mongodb::{optional_bson_datetime, Id},
};

/// Core invitation data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationCore {
    /// Single-use voting credential. Unique across all invitations.
    pub token: Token,
    /// Foreign Key election ID.
    pub election_id: Id,
    /// Foreign Key voter ID. Unique per election.
    pub voter_id: Id,
    /// 1-based batch this invitation was scheduled into.
    pub batch_number: u32,
    pub status: InvitationStatus,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    /// When the dispatcher confirmed delivery.
    #[serde(default, with = "optional_bson_datetime")]
    pub notified_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub expires_at: DateTime<Utc>,
}

impl InvitationCore {
    /// Create a fresh pending invitation with a new random token.
    pub fn new(
        election_id: Id,
        voter_id: Id,
        batch_number: u32,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token: Token::random(),
            election_id,
            voter_id,
            batch_number,
            status: InvitationStatus::Pending,
            created_at,
            notified_at: None,
            expires_at,
        }
    }

    /// Has the expiry time been reached at `now`?
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// An invitation without an ID.
pub type NewInvitation = InvitationCore;

/// An invitation from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub invitation: InvitationCore,
}

impl Deref for Invitation {
    type Target = InvitationCore;

    fn deref(&self) -> &Self::Target {
        &self.invitation
    }
}

impl DerefMut for Invitation {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.invitation
    }
}

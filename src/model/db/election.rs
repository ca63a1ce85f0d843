use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::{common::ElectionStatus, mongodb::Id};

/// An election, as registered by the election administration.
/// Read-only from the point of view of this service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Election {
    #[serde(rename = "_id")]
    pub id: Id,
    pub name: String,
    pub status: ElectionStatus,
    /// Department the election is restricted to; `None` means all departments.
    #[serde(default)]
    pub department_id: Option<Id>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub end_time: DateTime<Utc>,
    /// Batch size configured for this election, if any.
    #[serde(default)]
    pub batch_size: Option<u32>,
}

impl Election {
    pub fn is_active(&self) -> bool {
        self.status == ElectionStatus::Active
    }
}

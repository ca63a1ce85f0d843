//! The voting engine: batch scheduling of invitations, delivery through a
//! [`dispatch::Dispatcher`], ballot casting, and invitation expiry.

use thiserror::Error;

use crate::{model::mongodb::Id, store::StoreError};

pub mod casting;
pub mod dispatch;
pub mod results;
pub mod retry;
pub mod scheduler;
pub mod sweep;

pub use casting::{cast_vote, validate_token};
pub use dispatch::{Dispatcher, LogDispatcher, SharedDispatcher};
pub use results::{election_results, queue_status};
pub use retry::RetryPolicy;
pub use scheduler::{schedule, schedule_batches};
pub use sweep::{ExpirySweepFairing, ExpirySweeper};

/// Why a voting operation was refused.
#[derive(Debug, Error)]
pub enum VoteError {
    #[error("Invalid voting token")]
    InvalidToken,
    #[error("Vote already cast")]
    AlreadyVoted,
    #[error("Voting token expired")]
    TokenExpired,
    #[error("Voting token does not belong to this election")]
    ElectionMismatch,
    #[error("Candidate {0} is not standing in this election")]
    InvalidCandidate(Id),
    #[error("Election {0} not found")]
    ElectionNotFound(Id),
    #[error("Election {0} is not active")]
    ElectionInactive(Id),
    #[error(transparent)]
    Store(#[from] StoreError),
}

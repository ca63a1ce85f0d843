use rocket::{
    http::{Status, StatusClass},
    response::{self, Responder},
    serde::json::Json,
    Request, Response,
};
use serde::Serialize;
use thiserror::Error;

use crate::{store::StoreError, voting::VoteError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Vote(#[from] VoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// The HTTP status this error is reported with.
    pub fn status(&self) -> Status {
        match self {
            Self::Vote(VoteError::InvalidToken | VoteError::ElectionNotFound(_)) => Status::NotFound,
            Self::Vote(VoteError::Store(err)) | Self::Store(err) => store_status(err),
            Self::Vote(_) => Status::BadRequest,
        }
    }

    /// A stable, machine-readable name for the error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Vote(err) => match err {
                VoteError::InvalidToken => "invalid_token",
                VoteError::AlreadyVoted => "already_voted",
                VoteError::TokenExpired => "token_expired",
                VoteError::ElectionMismatch => "election_mismatch",
                VoteError::InvalidCandidate(_) => "invalid_candidate",
                VoteError::ElectionNotFound(_) => "election_not_found",
                VoteError::ElectionInactive(_) => "election_inactive",
                VoteError::Store(err) => store_kind(err),
            },
            Self::Store(err) => store_kind(err),
        }
    }
}

fn store_status(err: &StoreError) -> Status {
    match err {
        StoreError::Transient(_) => Status::ServiceUnavailable,
        _ => Status::InternalServerError,
    }
}

fn store_kind(err: &StoreError) -> &'static str {
    match err {
        StoreError::Transient(_) => "storage_unavailable",
        _ => "storage_error",
    }
}

/// The JSON body of every error response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let status = self.status();
        let message = if status.class() == StatusClass::ServerError {
            // Keep storage internals out of responses.
            error!("{self}");
            status.reason_lossy().to_string()
        } else {
            debug!("{self}");
            self.to_string()
        };
        let body = Json(ErrorBody {
            error: self.kind(),
            message,
        });
        Response::build_from(body.respond_to(req)?)
            .status(status)
            .ok()
    }
}

//! For some reason, the mongodb crate doesn't provide error code constants.
//! This module fills in the gaps.

use mongodb::error::{
    Error as DbError, ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR,
    UNKNOWN_TRANSACTION_COMMIT_RESULT,
};

pub const DUPLICATE_KEY: i32 = 11000;
pub const WRITE_CONFLICT: i32 = 112;

/// Return true if the given error is a duplicate key write error, either from
/// a single write or from any document of a bulk write.
pub fn is_duplicate_key_error(err: &DbError) -> bool {
    match *err.kind {
        ErrorKind::Write(WriteFailure::WriteError(ref e)) => e.code == DUPLICATE_KEY,
        ErrorKind::BulkWrite(ref failure) => failure
            .write_errors
            .as_ref()
            .map(|errors| errors.iter().any(|e| e.code == DUPLICATE_KEY))
            .unwrap_or(false),
        ErrorKind::Command(ref e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Return true if the given error means the whole operation can safely be
/// re-run from the start: the server labelled it transient, the commit outcome
/// is unknown, or a concurrent transaction touched the same document.
pub fn is_transient_error(err: &DbError) -> bool {
    if err.contains_label(TRANSIENT_TRANSACTION_ERROR)
        || err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
    {
        return true;
    }
    match *err.kind {
        ErrorKind::Command(ref e) => e.code == WRITE_CONFLICT,
        ErrorKind::Write(WriteFailure::WriteError(ref e)) => e.code == WRITE_CONFLICT,
        _ => false,
    }
}

//! Types shared between the database and API representations.

pub mod status;
pub mod token;

pub use status::{ElectionStatus, InvitationStatus, StatusCounts};
pub use token::Token;

//! DB-compatible (e.g. de/serialisable) types.
//!
//! The types in this module are serialised in an DB-friendly way, e.g.:
//!
//! - IDs and datetimes are serialised in MongoDB's own format.

pub mod ballot;
pub use ballot::{Ballot, BallotCore, NewBallot};

pub mod candidate;
pub use candidate::Candidate;

pub mod election;
pub use election::Election;

pub mod invitation;
pub use invitation::{Invitation, InvitationCore, NewInvitation};

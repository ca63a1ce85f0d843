//! Handing invitations over to whatever actually delivers them.
//!
//! Delivery never blocks the caller: batches are handed to the
//! [`Dispatcher`] on a background task, and the invitations it reports as
//! delivered are then marked notified.

use std::sync::Arc;

use chrono::Utc;
use rocket::tokio::{self, task::JoinHandle};

use crate::{
    model::{
        api::invitation::{DispatchReport, InvitationSummary, NotifiedReport},
        mongodb::Id,
    },
    store::{SharedStore, StoreError, VotingStore},
};

/// Something that can deliver voting links, e.g. by email.
///
/// Retries and backoff are the dispatcher's own business; it only reports
/// back which invitations made it.
#[rocket::async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver the invitations and return the IDs of those that were delivered.
    async fn deliver(&self, election_id: Id, invitations: &[InvitationSummary]) -> Vec<Id>;
}

/// The dispatcher as placed into Rocket's managed state.
pub type SharedDispatcher = Arc<dyn Dispatcher>;

/// A dispatcher that writes each voting link to the log and treats it as
/// delivered. Used when no real transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[rocket::async_trait]
impl Dispatcher for LogDispatcher {
    async fn deliver(&self, election_id: Id, invitations: &[InvitationSummary]) -> Vec<Id> {
        for invitation in invitations {
            info!(
                "Voting link for voter {} in election {election_id}: {}",
                invitation.voter_id, invitation.vote_url
            );
        }
        invitations.iter().map(|invitation| *invitation.id).collect()
    }
}

/// The still-pending invitations of a batch, ready for delivery.
///
/// Invitations that are already overdue are left for the expiry sweep rather
/// than handed out with a dead link.
pub async fn pending_invitations_for_batch(
    store: &dyn VotingStore,
    election_id: Id,
    batch_number: u32,
    vote_url_base: &str,
) -> Result<Vec<InvitationSummary>, StoreError> {
    let pending = store
        .pending_for_batch(election_id, batch_number, Utc::now())
        .await?;
    Ok(pending
        .into_iter()
        .map(|invitation| InvitationSummary::from_invitation(invitation, vote_url_base))
        .collect())
}

/// Record that the dispatcher delivered the given invitations.
pub async fn record_delivered(
    store: &dyn VotingStore,
    ids: &[Id],
) -> Result<NotifiedReport, StoreError> {
    let updated = store.mark_notified(ids, Utc::now()).await?;
    Ok(NotifiedReport { updated })
}

/// Deliver the invitations and mark the delivered ones notified.
/// Returns how many were marked.
pub async fn deliver_and_record(
    store: &dyn VotingStore,
    dispatcher: &dyn Dispatcher,
    election_id: Id,
    invitations: &[InvitationSummary],
) -> Result<u64, StoreError> {
    let delivered = dispatcher.deliver(election_id, invitations).await;
    let report = record_delivered(store, &delivered).await?;
    let missed = invitations.len().saturating_sub(delivered.len());
    if missed > 0 {
        warn!("{missed} invitations for election {election_id} were not delivered");
    }
    Ok(report.updated)
}

/// Deliver the invitations on a background task.
pub fn spawn_delivery(
    store: SharedStore,
    dispatcher: SharedDispatcher,
    election_id: Id,
    invitations: Vec<InvitationSummary>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match deliver_and_record(&*store, &*dispatcher, election_id, &invitations).await {
            Ok(notified) => {
                debug!("Marked {notified} invitations notified for election {election_id}")
            }
            Err(e) => error!("Failed to record deliveries for election {election_id}: {e}"),
        }
    })
}

/// Hand a batch's pending invitations to the dispatcher without waiting for
/// delivery.
pub async fn dispatch_batch(
    store: &SharedStore,
    dispatcher: &SharedDispatcher,
    election_id: Id,
    batch_number: u32,
    vote_url_base: &str,
) -> Result<DispatchReport, StoreError> {
    let pending =
        pending_invitations_for_batch(&**store, election_id, batch_number, vote_url_base).await?;
    let dispatched = pending.len();
    if dispatched > 0 {
        info!("Dispatching {dispatched} invitations of batch {batch_number} for election {election_id}");
        spawn_delivery(store.clone(), dispatcher.clone(), election_id, pending);
    }
    Ok(DispatchReport {
        batch_number: Some(batch_number),
        dispatched,
    })
}

/// Dispatch the lowest batch that still has pending invitations, if any.
pub async fn dispatch_next_batch(
    store: &SharedStore,
    dispatcher: &SharedDispatcher,
    election_id: Id,
    vote_url_base: &str,
) -> Result<DispatchReport, StoreError> {
    match store.next_pending_batch(election_id, Utc::now()).await? {
        Some(batch_number) => {
            dispatch_batch(store, dispatcher, election_id, batch_number, vote_url_base).await
        }
        None => {
            debug!("No pending batches left for election {election_id}");
            Ok(DispatchReport {
                batch_number: None,
                dispatched: 0,
            })
        }
    }
}

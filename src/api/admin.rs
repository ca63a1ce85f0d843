use rocket::{serde::json::Json, Route, State};

use crate::{
    config::Config,
    error::Result,
    model::{
        api::{
            election::ElectionResults,
            invitation::{
                DispatchReport, InvitationSummary, NotifiedReport, QueueStatus, ScheduleReport,
                ScheduleRequest,
            },
        },
        mongodb::Id,
    },
    store::SharedStore,
    voting::{self, dispatch, SharedDispatcher},
};

pub fn routes() -> Vec<Route> {
    routes![
        schedule_invitations,
        pending_for_batch,
        dispatch_next_batch,
        mark_notified,
        queue_status,
        election_results,
    ]
}

/// Create invitations for the given voters and start delivering the first batch.
#[post("/elections/<election_id>/invitations", data = "<request>", format = "json")]
async fn schedule_invitations(
    election_id: Id,
    request: Json<ScheduleRequest>,
    store: &State<SharedStore>,
    dispatcher: &State<SharedDispatcher>,
    config: &State<Config>,
) -> Result<Json<ScheduleReport>> {
    let ScheduleRequest {
        voter_ids,
        batch_size,
    } = request.into_inner();
    let report = voting::schedule_batches(
        store.inner().as_ref(),
        config,
        election_id,
        &voter_ids,
        batch_size,
    )
    .await?;

    if report.total_batches > 0 {
        dispatch::dispatch_batch(store, dispatcher, election_id, 1, config.vote_url_base()).await?;
    }

    Ok(Json(report))
}

#[get("/elections/<election_id>/batches/<batch_number>/pending")]
async fn pending_for_batch(
    election_id: Id,
    batch_number: u32,
    store: &State<SharedStore>,
    config: &State<Config>,
) -> Result<Json<Vec<InvitationSummary>>> {
    let pending = dispatch::pending_invitations_for_batch(
        store.inner().as_ref(),
        election_id,
        batch_number,
        config.vote_url_base(),
    )
    .await?;
    Ok(Json(pending))
}

#[post("/elections/<election_id>/batches/next")]
async fn dispatch_next_batch(
    election_id: Id,
    store: &State<SharedStore>,
    dispatcher: &State<SharedDispatcher>,
    config: &State<Config>,
) -> Result<Json<DispatchReport>> {
    let report =
        dispatch::dispatch_next_batch(store, dispatcher, election_id, config.vote_url_base())
            .await?;
    Ok(Json(report))
}

/// Delivery confirmations from an external dispatcher.
#[post("/invitations/notified", data = "<ids>", format = "json")]
async fn mark_notified(
    ids: Json<Vec<Id>>,
    store: &State<SharedStore>,
) -> Result<Json<NotifiedReport>> {
    let report = dispatch::record_delivered(store.inner().as_ref(), &ids).await?;
    Ok(Json(report))
}

#[get("/elections/<election_id>/queue")]
async fn queue_status(election_id: Id, store: &State<SharedStore>) -> Result<Json<QueueStatus>> {
    let status = voting::queue_status(store.inner().as_ref(), election_id).await?;
    Ok(Json(status))
}

#[get("/elections/<election_id>/results")]
async fn election_results(
    election_id: Id,
    store: &State<SharedStore>,
) -> Result<Json<ElectionResults>> {
    let results = voting::election_results(store.inner().as_ref(), election_id).await?;
    Ok(Json(results))
}

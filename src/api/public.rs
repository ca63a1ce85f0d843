use rocket::{serde::json::Json, Route, State};

use crate::{
    config::Config,
    error::Result,
    model::api::{
        ballot::{BallotReceipt, CastRequest},
        election::ElectionSummary,
    },
    store::SharedStore,
    voting,
};

pub fn routes() -> Vec<Route> {
    routes![validate, cast]
}

/// Check a voting link and describe the election it is for.
#[get("/vote/<token>")]
async fn validate(token: &str, store: &State<SharedStore>) -> Result<Json<ElectionSummary>> {
    let election = voting::validate_token(store.inner().as_ref(), token).await?;
    Ok(Json(election))
}

#[post("/vote/<token>", data = "<request>", format = "json")]
async fn cast(
    token: &str,
    request: Json<CastRequest>,
    store: &State<SharedStore>,
    config: &State<Config>,
) -> Result<Json<BallotReceipt>> {
    let CastRequest {
        election_id,
        candidate_id,
    } = request.into_inner();
    let ballot = voting::cast_vote(
        store.inner().as_ref(),
        token,
        election_id,
        candidate_id,
        config.retry_policy(),
    )
    .await?;
    Ok(Json(ballot.into()))
}

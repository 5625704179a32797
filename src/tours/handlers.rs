use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    dto::{DataResponse, PlanData, StatsData, TourListResponse, TourResponse},
    repo,
};
use crate::{
    auth::{
        pipeline::{enforce, Guard, Pipeline},
        repo_types::Role,
    },
    error::AppError,
    query::QueryShape,
    state::AppState,
};

type Params = Vec<(String, String)>;

pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/tours/top-5-cheap", get(top_five_cheap))
        .route("/tours/tour-stats", get(tour_stats))
        .route("/tours/monthly-plan/:year", get(monthly_plan))
        .route("/tours/:id", get(get_tour))
}

pub fn member_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/tours", get(list_tours))
        .route_layer(middleware::from_fn_with_state(
            Guard::new(state, Pipeline::authenticated()),
            enforce,
        ))
}

pub fn staff_routes(state: &AppState) -> Router<AppState> {
    let staff = Pipeline::authenticated().restrict_to(&[Role::Admin, Role::LeadGuide]);
    Router::new()
        .route("/tours", post(create_tour))
        .route("/tours/:id", patch(update_tour).delete(delete_tour))
        .route_layer(middleware::from_fn_with_state(
            Guard::new(state, staff),
            enforce,
        ))
}

/// Forces the cheapest-best-rated five, whatever the client asked for.
pub fn top_five_cheap_params(mut params: Params) -> Params {
    params.retain(|(k, _)| !matches!(k.as_str(), "limit" | "sort" | "fields"));
    params.push(("limit".into(), "5".into()));
    params.push(("sort".into(), "-ratingsAverage,price".into()));
    params.push((
        "fields".into(),
        "name,price,ratingsAverage,summary,difficulty".into(),
    ));
    params
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::Validation(format!("Invalid _id: {raw}")))
}

fn year_range(raw: &str) -> Result<(OffsetDateTime, OffsetDateTime), AppError> {
    raw.trim()
        .parse::<i32>()
        .ok()
        .and_then(repo::year_bounds)
        .ok_or_else(|| AppError::Validation(format!("Invalid year: {raw}")))
}

fn not_found() -> AppError {
    AppError::NotFound("No tour found with that ID".into())
}

async fn run_list(state: &AppState, params: &Params) -> Result<Json<TourListResponse>, AppError> {
    let shape = QueryShape::from_params(params);
    let started = Instant::now();
    let tours = repo::list(&state.db, &shape).await?;
    debug!(
        results = tours.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "tour query"
    );
    Ok(Json(TourListResponse::new(tours)))
}

#[instrument(skip(state))]
pub async fn list_tours(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Result<Json<TourListResponse>, AppError> {
    run_list(&state, &params).await
}

#[instrument(skip(state))]
pub async fn top_five_cheap(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Result<Json<TourListResponse>, AppError> {
    run_list(&state, &top_five_cheap_params(params)).await
}

#[instrument(skip(state))]
pub async fn tour_stats(
    State(state): State<AppState>,
) -> Result<Json<DataResponse<StatsData>>, AppError> {
    let stats = repo::stats(&state.db).await?;
    debug!(groups = stats.len(), "tour stats");
    Ok(Json(DataResponse::new(StatsData { stats })))
}

#[instrument(skip(state))]
pub async fn monthly_plan(
    State(state): State<AppState>,
    Path(year): Path<String>,
) -> Result<Json<DataResponse<PlanData>>, AppError> {
    let (from, until) = year_range(&year)?;
    let plan = repo::monthly_plan(&state.db, from, until).await?;
    Ok(Json(DataResponse::new(PlanData { plan })))
}

#[instrument(skip(state))]
pub async fn get_tour(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TourResponse>, AppError> {
    let id = parse_id(&id)?;
    let tour = repo::find_by_id(&state.db, id).await?.ok_or_else(not_found)?;
    Ok(Json(TourResponse::new(tour)))
}

#[instrument(skip(state, payload))]
pub async fn create_tour(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<TourResponse>), AppError> {
    let Value::Object(body) = payload else {
        return Err(AppError::Validation("Tour body must be a JSON object".into()));
    };
    let tour = repo::insert(&state.db, body).await?;
    info!(tour_id = %tour["_id"], "tour created");
    Ok((StatusCode::CREATED, Json(TourResponse::new(tour))))
}

#[instrument(skip(state, payload))]
pub async fn update_tour(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<TourResponse>, AppError> {
    let id = parse_id(&id)?;
    let Value::Object(patch) = payload else {
        return Err(AppError::Validation("Tour body must be a JSON object".into()));
    };
    let tour = repo::update(&state.db, id, patch).await?.ok_or_else(not_found)?;
    info!(tour_id = %id, "tour updated");
    Ok(Json(TourResponse::new(tour)))
}

#[instrument(skip(state))]
pub async fn delete_tour(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_id(&id)?;
    if !repo::delete(&state.db, id).await? {
        return Err(not_found());
    }
    info!(tour_id = %id, "tour deleted");
    Ok(StatusCode::NO_CONTENT)
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, patch, post},
    Json, Router,
};
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{
            AuthResponse, ForgotPasswordRequest, LoginRequest, MessageResponse, PublicUser,
            ResetPasswordRequest, SignupRequest, UpdatePasswordRequest, UserData,
        },
        extractors::CurrentUser,
        pipeline::{enforce, Guard, Pipeline},
        repo_types::Identity,
        services::NewAccount,
    },
    error::AppError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/users/signup", post(signup))
        .route("/users/login", post(login))
        .route("/users/forgotPassword", post(forgot_password))
        .route("/users/resetPassword/:token", patch(reset_password))
}

pub fn me_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/users/me", get(get_me))
        .route("/users/updateMyPassword", patch(update_password))
        .route_layer(middleware::from_fn_with_state(
            Guard::new(state, Pipeline::authenticated()),
            enforce,
        ))
}

fn issue_for(state: &AppState, identity: &Identity) -> Result<AuthResponse, AppError> {
    let token = state.keys.issue(identity.id)?;
    Ok(AuthResponse::new(token, identity))
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    Json(payload): Json<SignupRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), AppError> {
    let identity = state
        .accounts
        .signup(NewAccount {
            name: payload.name,
            email: payload.email,
            password: payload.password,
            password_confirm: payload.password_confirm,
        })
        .await?;

    info!(user_id = %identity.id, email = %identity.email, "user signed up");
    Ok((StatusCode::CREATED, Json(issue_for(&state, &identity)?)))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let identity = state
        .accounts
        .check_credentials(&payload.email, &payload.password)
        .await?;

    info!(user_id = %identity.id, "user logged in");
    Ok(Json(issue_for(&state, &identity)?))
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let sent = Json(MessageResponse {
        status: "success",
        message: "Token sent to email!",
    });

    match state.reset.request_and_deliver(&payload.email).await {
        Ok(()) => Ok(sent),
        Err(AppError::NotFound(_)) if state.config.reset.conceal_unknown_email => {
            warn!("reset requested for unknown email");
            Ok(sent)
        }
        Err(e) => Err(e),
    }
}

#[instrument(skip(state, token, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let identity = state
        .reset
        .redeem(&token, &payload.password, &payload.password_confirm)
        .await?;
    Ok(Json(issue_for(&state, &identity)?))
}

#[instrument(skip(state, identity, payload), fields(user_id = %identity.id))]
pub async fn update_password(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Json(payload): Json<UpdatePasswordRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let identity = state
        .accounts
        .update_password(
            identity,
            &payload.password_current,
            &payload.password,
            &payload.password_confirm,
        )
        .await?;

    info!(user_id = %identity.id, "password updated");
    Ok(Json(issue_for(&state, &identity)?))
}

#[instrument(skip(identity), fields(user_id = %identity.id))]
pub async fn get_me(CurrentUser(identity): CurrentUser) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "success",
        "data": UserData { user: PublicUser::from(&identity) },
    }))
}

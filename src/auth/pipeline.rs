//! Access control for protected routes.
//!
//! A [`Pipeline`] is an ordered list of stages run over a [`RequestContext`].
//! Every pipeline starts with authentication, so an authorization stage can
//! never run without an identity to check. The first failing stage stops the
//! chain and the route handler is not invoked.

use std::sync::Arc;

use axum::{
    extract::{FromRef, Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use super::{jwt::JwtKeys, repo::IdentityStore, repo_types::{Identity, Role}};
use crate::{error::AppError, state::AppState};

/// Request-scoped data shared by the stages.
#[derive(Debug, Default)]
pub struct RequestContext {
    pub bearer: Option<String>,
    pub identity: Option<Identity>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned);
        Self {
            bearer,
            identity: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Stage {
    Authenticate,
    Authorize(Vec<Role>),
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn authenticated() -> Self {
        Self {
            stages: vec![Stage::Authenticate],
        }
    }

    pub fn restrict_to(mut self, roles: &[Role]) -> Self {
        self.stages.push(Stage::Authorize(roles.to_vec()));
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub async fn run(
        &self,
        auth: &Authenticator,
        mut ctx: RequestContext,
    ) -> Result<RequestContext, AppError> {
        for stage in &self.stages {
            ctx = match stage {
                Stage::Authenticate => auth.authenticate(ctx).await?,
                Stage::Authorize(roles) => authorize(roles, ctx)?,
            };
        }
        Ok(ctx)
    }
}

/// Dependencies of the authenticate stage.
#[derive(Clone)]
pub struct Authenticator {
    keys: JwtKeys,
    identities: Arc<dyn IdentityStore>,
}

impl FromRef<AppState> for Authenticator {
    fn from_ref(state: &AppState) -> Self {
        Self::new(state.keys.clone(), state.accounts.store().clone())
    }
}

impl Authenticator {
    pub fn new(keys: JwtKeys, identities: Arc<dyn IdentityStore>) -> Self {
        Self { keys, identities }
    }

    pub async fn authenticate(&self, mut ctx: RequestContext) -> Result<RequestContext, AppError> {
        let token = ctx.bearer.as_deref().ok_or_else(|| {
            AppError::unauthenticated("You are not logged in! Please log in to get access.")
        })?;

        let claims = self.keys.verify(token).map_err(|e| {
            warn!(error = %e, "token rejected");
            AppError::from(e)
        })?;

        let identity = self
            .identities
            .find_by_id(claims.sub)
            .await?
            .ok_or_else(|| {
                warn!(user_id = %claims.sub, "token subject no longer exists");
                AppError::unauthenticated("The user belonging to this token no longer exists.")
            })?;

        if identity.changed_password_after(claims.iat) {
            warn!(user_id = %identity.id, "token predates password change");
            return Err(AppError::unauthenticated(
                "User recently changed password! Please log in again.",
            ));
        }

        debug!(user_id = %identity.id, role = %identity.role, "authenticated");
        ctx.identity = Some(identity);
        Ok(ctx)
    }
}

pub fn authorize(allowed: &[Role], ctx: RequestContext) -> Result<RequestContext, AppError> {
    let identity = ctx
        .identity
        .as_ref()
        .ok_or_else(|| AppError::unauthenticated("You are not logged in! Please log in to get access."))?;
    if !allowed.contains(&identity.role) {
        warn!(user_id = %identity.id, role = %identity.role, "role not permitted");
        return Err(AppError::Forbidden);
    }
    Ok(ctx)
}

/// Middleware state: one pipeline per route group.
#[derive(Clone)]
pub struct Guard {
    auth: Authenticator,
    pipeline: Arc<Pipeline>,
}

impl Guard {
    pub fn new(state: &AppState, pipeline: Pipeline) -> Self {
        Self {
            auth: Authenticator::from_ref(state),
            pipeline: Arc::new(pipeline),
        }
    }
}

/// Runs the guard's pipeline and attaches the identity for the handler.
pub async fn enforce(
    State(guard): State<Guard>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ctx = RequestContext::from_headers(req.headers());
    let ctx = guard.pipeline.run(&guard.auth, ctx).await?;
    if let Some(identity) = ctx.identity {
        req.extensions_mut().insert(identity);
    }
    Ok(next.run(req).await)
}

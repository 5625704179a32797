use std::net::SocketAddr;

use axum::{
    extract::{MatchedPath, OriginalUri},
    routing::get,
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::AppError;
use crate::state::AppState;
use crate::{auth, tours};

async fn unknown_route(OriginalUri(uri): OriginalUri) -> AppError {
    AppError::NotFound(format!("Can't find {} on this server!", uri.path()))
}

/// Reset tokens are credentials; keep them out of span fields.
fn redacted_path(path: &str) -> String {
    const RESET_SEGMENT: &str = "/resetPassword/";
    match path.find(RESET_SEGMENT) {
        Some(at) => {
            let start = at + RESET_SEGMENT.len();
            let rest = &path[start..];
            let tail = rest.find('/').map(|i| &rest[i..]).unwrap_or("");
            format!("{}:token{}", &path[..start], tail)
        }
        None => path.to_string(),
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .nest(
            "/api/v1",
            Router::new()
                .merge(auth::router(&state))
                .merge(tours::router(&state))
                .route("/health", get(|| async { "ok" })),
        )
        .fallback(unknown_route)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let route = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_else(|| redacted_path(req.uri().path()));
                    tracing::info_span!(
                        "http_request",
                        %method,
                        route = %route,
                        status = tracing::field::Empty
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        let latency_ms = latency.as_millis() as u64;
                        if status.is_server_error() {
                            tracing::error!(%status, latency_ms, "response");
                        } else {
                            tracing::info!(%status, latency_ms, "response");
                        }
                    },
                ),
        )
}

pub async fn serve(app: Router) -> anyhow::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        std::env::var("APP_PORT").unwrap_or_else(|_| "8080".into())
    )
    .parse()?;

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::notify::fake::CapturedLogs;

    fn app() -> Router {
        build_app(AppState::fake(Arc::default(), Arc::default()))
    }

    #[tokio::test]
    async fn health_is_ok() {
        let res = app()
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_uses_error_envelope() {
        let res = app()
            .oneshot(Request::get("/api/v1/nowhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "fail");
        assert_eq!(body["message"], "Can't find /api/v1/nowhere on this server!");
    }

    #[test]
    fn reset_token_is_cut_from_logged_paths() {
        assert_eq!(
            redacted_path("/api/v1/users/resetPassword/abc123"),
            "/api/v1/users/resetPassword/:token"
        );
        assert_eq!(
            redacted_path("/api/v1/users/resetPassword/abc123/extra"),
            "/api/v1/users/resetPassword/:token/extra"
        );
        assert_eq!(redacted_path("/api/v1/tours"), "/api/v1/tours");
    }

    #[tokio::test]
    async fn request_span_never_records_reset_token() {
        let logs = CapturedLogs::default();
        let _guard = logs.install();
        let token = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

        for uri in [
            format!("/api/v1/users/resetPassword/{token}"),
            format!("/api/v1/users/resetPassword/{token}/nowhere"),
        ] {
            let res = app()
                .oneshot(
                    Request::patch(uri)
                        .header("content-type", "application/json")
                        .body(Body::from(
                            r#"{"password":"newpass123","passwordConfirm":"newpass123"}"#,
                        ))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert!(res.status().is_client_error());
        }

        let out = logs.contents();
        assert!(out.contains("http_request"));
        assert!(out.contains("resetPassword/:token"));
        assert!(!out.contains(token));
    }
}

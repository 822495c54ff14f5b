use super::{ApiError, ErrorBody, credential_handle, deadline};
use crate::{api::ApiState, broker::DbIdentity};
use axum::{Extension, Json, http::HeaderMap};
use std::sync::Arc;
use tracing::instrument;

#[utoipa::path(
    get,
    path= "/test_db",
    responses (
        (status = 200, description = "Session identity as seen by PostgreSQL", body = [DbIdentity]),
        (status = 401, description = "No delegated credentials", body = ErrorBody),
        (status = 502, description = "Database or KDC failure", body = ErrorBody),
        (status = 504, description = "Slot or deadline timeout", body = ErrorBody),
    ),
    tag = "database",
)]
/// Connect to PostgreSQL as the caller and report who the server thinks we are.
#[instrument(skip(headers, state))]
pub async fn test_db(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
) -> Result<Json<Vec<DbIdentity>>, ApiError> {
    let handle = credential_handle(&headers, &state)?;
    let rows = state
        .orchestrator
        .session_identity(&handle, deadline(&state))
        .await?;
    Ok(Json(rows))
}

#[cfg(test)]
mod tests {
    use crate::{
        api::{
            router,
            testing::{HEADER, Harness},
        },
        pgwire::testing::{Behavior, MockPostgres},
    };
    use anyhow::Result;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use std::net::TcpListener;
    use tower::ServiceExt;

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    #[tokio::test]
    async fn returns_one_identity_row() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let db = MockPostgres::start(Behavior::Accept).await?;
        let harness = Harness::new();
        let app = router(harness.state("http://127.0.0.1:1", db.port())?);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/test_db")
                    .header(HEADER, harness.ccache("jdoe"))
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value =
            serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await?)?;
        assert_eq!(
            body,
            json!([{
                "current_user": "jdoe",
                "session_user": "jdoe",
                "timestamp": "2024-05-01T12:30:45.123456+00:00"
            }])
        );
        assert_eq!(db.connections().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_handshake_is_bad_gateway() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let db = MockPostgres::start(Behavior::RejectAuth).await?;
        let harness = Harness::new();
        let app = router(harness.state("http://127.0.0.1:1", db.port())?);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/test_db")
                    .header(HEADER, harness.ccache("jdoe"))
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: Value =
            serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await?)?;
        assert_eq!(body["error"], "DownstreamAuthRejected");
        assert!(
            !body["message"]
                .as_str()
                .unwrap_or_default()
                .contains("krb5cc")
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() -> Result<()> {
        let harness = Harness::new();
        let app = router(harness.state("http://127.0.0.1:1", 1)?);

        let response = app
            .oneshot(Request::builder().uri("/test_db").body(Body::empty())?)
            .await?;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(harness.source.calls(), 0);
        Ok(())
    }
}

use super::{ApiError, ErrorBody, credential_handle, deadline};
use crate::api::ApiState;
use axum::{Extension, Json, extract::Query, http::HeaderMap};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::instrument;
use utoipa::IntoParams;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UserShowParams {
    /// Directory login to look up.
    uid: Option<String>,
}

#[utoipa::path(
    get,
    path= "/user_show",
    params(UserShowParams),
    responses (
        (status = 200, description = "Directory record, as returned by FreeIPA", body = Object),
        (status = 400, description = "Missing uid", body = ErrorBody),
        (status = 401, description = "No delegated credentials", body = ErrorBody),
        (status = 502, description = "Directory or KDC failure", body = ErrorBody),
        (status = 504, description = "Deadline exceeded", body = ErrorBody),
    ),
    tag = "directory",
)]
/// Look a user up in FreeIPA as the caller.
#[instrument(skip(headers, state))]
pub async fn user_show(
    headers: HeaderMap,
    Query(params): Query<UserShowParams>,
    state: Extension<Arc<ApiState>>,
) -> Result<Json<Map<String, Value>>, ApiError> {
    let handle = credential_handle(&headers, &state)?;
    let uid = params
        .uid
        .filter(|uid| !uid.trim().is_empty())
        .ok_or(ApiError::MissingParameter("uid"))?;

    let record = state
        .orchestrator
        .user_show(&handle, &uid, deadline(&state))
        .await?;
    Ok(Json(record))
}
